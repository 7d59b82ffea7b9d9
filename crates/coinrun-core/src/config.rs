use crate::error::FundingError;
use crate::types::Coins;

/// Default coins required to trigger one run.
pub const DEFAULT_RUN_THRESHOLD: Coins = Coins(10);
/// Default one-time onboarding grant.
pub const DEFAULT_STARTER_GRANT: Coins = Coins(50);
/// Default per-commitment cap.
pub const DEFAULT_MAX_COMMITMENT: Coins = Coins(10_000);

/// Persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep all state in process memory only.
    #[default]
    Memory,
    /// Mirror every committed changeset to PostgreSQL and hydrate from it on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Funding rules applied by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingPolicy {
    pub run_threshold: Coins,
    pub starter_grant: Coins,
    pub max_commitment: Coins,
}

impl Default for FundingPolicy {
    fn default() -> Self {
        Self {
            run_threshold: DEFAULT_RUN_THRESHOLD,
            starter_grant: DEFAULT_STARTER_GRANT,
            max_commitment: DEFAULT_MAX_COMMITMENT,
        }
    }
}

impl FundingPolicy {
    pub fn validate(&self) -> Result<(), FundingError> {
        if self.run_threshold.is_zero() {
            return Err(FundingError::validation("run threshold must be positive"));
        }
        if self.max_commitment.is_zero() {
            return Err(FundingError::validation(
                "max commitment must be at least one coin",
            ));
        }
        Ok(())
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub policy: FundingPolicy,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn with_policy(mut self, policy: FundingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }
}
