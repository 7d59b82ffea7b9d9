use crate::types::{Coins, PrincipalId, RequestId, RequestStatus, RunId, RunStatus};
use thiserror::Error;

/// Failure classes surfaced to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    StateConflict,
    ResourceIntegrity,
    Authorization,
    /// Bookkeeping bug. Never expected in correct operation.
    Fatal,
    Infrastructure,
}

/// Funding engine errors.
///
/// Every variant is detected before any state is written; a failed command
/// leaves wallets, commitments, runs, and both logs untouched.
#[derive(Debug, Error)]
pub enum FundingError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("principal '{0}' already exists")]
    DuplicatePrincipal(String),

    #[error("principal '{0}' not found")]
    PrincipalNotFound(PrincipalId),

    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("{0} not found")]
    RequestNotFound(RequestId),

    #[error("{0} not found")]
    RunNotFound(RunId),

    #[error("{request} is {status} and no longer accepts commitments")]
    RequestClosed {
        request: RequestId,
        status: RequestStatus,
    },

    #[error("{run} is {status} and not reviewable")]
    NotReviewable { run: RunId, status: RunStatus },

    #[error("{run} is {status} and cannot be rerun")]
    CannotRerun { run: RunId, status: RunStatus },

    #[error("{run} cannot move from {from} to {to}")]
    InvalidRunTransition {
        run: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("insufficient balance for {principal}: required {required}, available {available}")]
    InsufficientBalance {
        principal: PrincipalId,
        required: Coins,
        available: Coins,
    },

    #[error("maintainer access required: '{0}' does not maintain the resource")]
    MaintainerAccessRequired(PrincipalId),

    #[error("allocation invariant violation: {0}")]
    AllocationInvariantViolation(String),

    #[error("ledger invariant violation: {0}")]
    LedgerInvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FundingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAmount(_) | Self::Validation(_) | Self::DuplicatePrincipal(_) => {
                ErrorClass::Validation
            }
            Self::PrincipalNotFound(_)
            | Self::ResourceNotFound(_)
            | Self::RequestNotFound(_)
            | Self::RunNotFound(_) => ErrorClass::NotFound,
            Self::RequestClosed { .. }
            | Self::NotReviewable { .. }
            | Self::CannotRerun { .. }
            | Self::InvalidRunTransition { .. } => ErrorClass::StateConflict,
            Self::InsufficientBalance { .. } => ErrorClass::ResourceIntegrity,
            Self::MaintainerAccessRequired(_) => ErrorClass::Authorization,
            Self::AllocationInvariantViolation(_) | Self::LedgerInvariantViolation(_) => {
                ErrorClass::Fatal
            }
            Self::Storage(_) | Self::Serialization(_) => ErrorClass::Infrastructure,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<serde_json::Error> for FundingError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_taxonomy() {
        assert_eq!(
            FundingError::InvalidAmount("zero".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            FundingError::InsufficientBalance {
                principal: PrincipalId::new("alice"),
                required: Coins(20),
                available: Coins(5),
            }
            .class(),
            ErrorClass::ResourceIntegrity
        );
        assert_eq!(
            FundingError::MaintainerAccessRequired(PrincipalId::new("mallory")).class(),
            ErrorClass::Authorization
        );
        assert!(FundingError::AllocationInvariantViolation("short".into()).is_fatal());
    }

    #[test]
    fn messages_name_the_offending_entity() {
        let err = FundingError::NotReviewable {
            run: RunId(4),
            status: RunStatus::Queued,
        };
        assert_eq!(err.to_string(), "run-4 is queued and not reviewable");
    }
}
