//! Collaborator adapters for coinrun: resource registry, coin-pack pricing, and a
//! simulated work executor.

#![deny(unsafe_code)]

pub mod executor;
pub mod pricing;
pub mod registry;

pub use executor::SimulatedWorkExecutor;
pub use pricing::{CoinPack, CoinPackCatalog, PricingError};
pub use registry::{LocalResourceRegistry, RegisteredResource, RegistryError};
