//! Coin funding ledger and run scheduler.
//!
//! Principals hold coin wallets and commit coins to funding requests. Once a
//! request accumulates a threshold's worth of commitments, the allocator
//! consumes them first-come-first-served into exactly one queued run. Reviewer
//! outcomes close the loop: approval keeps the coins spent, rejection refunds
//! exactly the allocations that paid for the run, and a rerun reopens funding.
//!
//! Every command applies atomically and leaves a hash-chained ledger entry
//! and audit trail behind.

#![deny(unsafe_code)]

pub mod allocator;
pub mod audit;
pub mod clock;
pub mod commitments;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod principals;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod types;
pub mod validate;

pub use allocator::{plan_allocation, AllocationSlice};
pub use audit::{AuditEntry, AuditRefs, EXECUTOR_ACTOR};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commitments::CommitOutcome;
pub use config::{EngineConfig, FundingPolicy, StorageConfig};
pub use engine::{FundingEngine, FundingRequestDetails};
pub use error::{ErrorClass, FundingError};
pub use ledger::{LedgerEntry, LedgerEntryKind, LedgerRef, WalletTotals};
pub use registry::ResourceRegistry;
pub use scheduler::ReviewOutcome;
pub use state::{Changeset, FundingState, FundingTxn, IntegrityReport};
pub use storage::StateStore;
pub use types::{
    Allocation, AllocationId, AllocationStatus, Coins, Commitment, CommitmentId, FundingRequest,
    PriceRef, Principal, PrincipalId, RequestId, RequestStatus, ResourceId, ResourceRecord, Run,
    RunId, RunReport, RunStatus, Wallet,
};
