use crate::types::{ResourceId, ResourceRecord};
use async_trait::async_trait;

/// Lookup of target resources and their maintainers.
///
/// Resources are created and owned elsewhere; the engine only resolves them.
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn resolve(&self, resource: &ResourceId) -> Option<ResourceRecord>;
}
