use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coinrun_core::validate::trimmed_len;
use coinrun_core::{FundingError, PrincipalId, ResourceId, ResourceRecord, ResourceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid resource: {0}")]
    Validation(String),
    #[error("resource slug '{0}' is already taken")]
    DuplicateSlug(String),
    #[error("resource registry lock poisoned")]
    LockPoisoned,
    #[error("resource registry IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<FundingError> for RegistryError {
    fn from(err: FundingError) -> Self {
        match err {
            FundingError::Validation(message) => Self::Validation(message),
            other => Self::Validation(other.to_string()),
        }
    }
}

/// A registered target resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredResource {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub maintainer: PrincipalId,
    pub created_at: DateTime<Utc>,
}

impl RegisteredResource {
    pub fn record(&self) -> ResourceRecord {
        ResourceRecord {
            id: ResourceId::new(self.slug.clone()),
            name: self.name.clone(),
            maintainer: self.maintainer.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryData {
    resources: BTreeMap<String, RegisteredResource>,
}

/// Resource registry kept in memory, optionally mirrored to a JSON file.
///
/// In file mode the registry is persisted after every registration so
/// resources survive service restarts.
#[derive(Debug)]
pub struct LocalResourceRegistry {
    path: Option<PathBuf>,
    data: RwLock<RegistryData>,
}

impl LocalResourceRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(RegistryData::default()),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                RegistryData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            RegistryData::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn register(
        &self,
        slug: &str,
        name: &str,
        description: &str,
        maintainer: PrincipalId,
    ) -> Result<RegisteredResource, RegistryError> {
        let slug = slug.trim().to_string();
        if !(2..=40).contains(&slug.chars().count())
            || !slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(RegistryError::Validation(
                "slug must be 2-40 characters of lowercase letters, digits and '-'".to_string(),
            ));
        }
        let name = trimmed_len("name", name, 2, 80)?;
        let description = trimmed_len("description", description, 10, 280)?;

        let mut data = self.data.write().map_err(|_| RegistryError::LockPoisoned)?;
        if data.resources.contains_key(&slug) {
            return Err(RegistryError::DuplicateSlug(slug));
        }

        let resource = RegisteredResource {
            slug: slug.clone(),
            name,
            description,
            maintainer,
            created_at: Utc::now(),
        };
        data.resources.insert(slug.clone(), resource.clone());
        if let Err(err) = self.persist(&data) {
            data.resources.remove(&slug);
            return Err(err);
        }

        info!(resource = %slug, maintainer = %resource.maintainer, "resource registered");
        Ok(resource)
    }

    pub fn get(&self, slug: &str) -> Result<Option<RegisteredResource>, RegistryError> {
        let data = self.data.read().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(data.resources.get(slug).cloned())
    }

    pub fn list(&self) -> Result<Vec<RegisteredResource>, RegistryError> {
        let data = self.data.read().map_err(|_| RegistryError::LockPoisoned)?;
        let mut values: Vec<RegisteredResource> = data.resources.values().cloned().collect();
        values.sort_by_key(|item| item.created_at);
        Ok(values)
    }

    fn persist(&self, data: &RegistryData) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl ResourceRegistry for LocalResourceRegistry {
    async fn resolve(&self, resource: &ResourceId) -> Option<ResourceRecord> {
        self.get(&resource.0)
            .ok()
            .flatten()
            .map(|stored| stored.record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn owner() -> PrincipalId {
        PrincipalId::new("owner")
    }

    #[test]
    fn validates_and_rejects_duplicate_slugs() {
        let registry = LocalResourceRegistry::in_memory();
        registry
            .register(
                "test-repo",
                "Test Repo",
                "A test repository for testing",
                owner(),
            )
            .unwrap();

        assert!(matches!(
            registry.register(
                "test-repo",
                "Test Repo 2",
                "Another test repository",
                owner(),
            ),
            Err(RegistryError::DuplicateSlug(_))
        ));
        assert!(matches!(
            registry.register(
                "Bad_Slug",
                "Name",
                "Long enough description",
                owner(),
            ),
            Err(RegistryError::Validation(_))
        ));
        let err = registry
            .register("ok-slug", "N", "Long enough description", owner())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid resource: name must be between 2 and 80 characters"
        );
        assert!(matches!(
            registry.register("ok-slug", "Name", "short", owner()),
            Err(RegistryError::Validation(_))
        ));
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolves_maintainer() {
        let registry = LocalResourceRegistry::in_memory();
        registry
            .register("demo", "Demo", "A demonstration resource", owner())
            .unwrap();
        let record = registry.resolve(&ResourceId::new("demo")).await.unwrap();
        assert_eq!(record.maintainer, owner());
        assert!(registry.resolve(&ResourceId::new("nope")).await.is_none());
    }

    #[test]
    fn file_registry_persists_across_reload() {
        let dir = std::env::temp_dir().join(format!("coinrun-registry-{}", Uuid::new_v4()));
        let path = dir.join("resources.json");

        let registry = LocalResourceRegistry::load(&path).unwrap();
        registry
            .register("demo", "Demo", "A demonstration resource", owner())
            .unwrap();

        let reloaded = LocalResourceRegistry::load(&path).unwrap();
        let stored = reloaded.get("demo").unwrap().unwrap();
        assert_eq!(stored.name, "Demo");
        assert_eq!(reloaded.path(), Some(path.as_path()));

        let _ = fs::remove_dir_all(dir);
    }
}
