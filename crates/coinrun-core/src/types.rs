use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of an onboarded principal (the username).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a target resource issued by the resource registry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// Funding request identifier; ids grow in submission order.
    RequestId,
    "request"
);
sequential_id!(
    /// Commitment identifier; id order is creation order, which drives FCFS allocation.
    CommitmentId,
    "commitment"
);
sequential_id!(RunId, "run");
sequential_id!(AllocationId, "allocation");

/// Whole-coin amount. Coins are never fractional and never negative.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Coins(pub u64);

impl Coins {
    pub const ZERO: Coins = Coins(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Coins) -> Option<Coins> {
        self.0.checked_add(other.0).map(Coins)
    }

    pub fn checked_sub(self, other: Coins) -> Option<Coins> {
        self.0.checked_sub(other.0).map(Coins)
    }

    pub fn min(self, other: Coins) -> Coins {
        Coins(self.0.min(other.0))
    }

    /// Signed ledger delta for this amount.
    pub fn as_delta(self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} coins", self.0)
    }
}

/// Lifecycle of a funding request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Queued,
    InProgress,
    AwaitingReview,
    Approved,
    Rejected,
    Closed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::AwaitingReview => "awaiting_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }

    /// Terminal requests accept no further commitments.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Closed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Approved,
    RerunRequested,
    Rejected,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Approved => "approved",
            Self::RerunRequested => "rerun_requested",
            Self::Rejected => "rejected",
        }
    }

    /// At most one run per request may be active.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Reviewer actions are legal only once the executor has reported back.
    pub fn is_reviewable(self) -> bool {
        matches!(self, Self::Completed | Self::RerunRequested)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocation state of a commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Reserved,
    ConsumedByRun,
    Refunded,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::ConsumedByRun => "consumed_by_run",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An onboarded principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub email: String,
    pub onboarded_at: DateTime<Utc>,
}

/// Coin balance of one principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub principal: PrincipalId,
    pub available: Coins,
    pub lifetime_granted: Coins,
    pub lifetime_purchased: Coins,
    pub lifetime_spent: Coins,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn empty(principal: PrincipalId, at: DateTime<Utc>) -> Self {
        Self {
            principal,
            available: Coins::ZERO,
            lifetime_granted: Coins::ZERO,
            lifetime_purchased: Coins::ZERO,
            lifetime_spent: Coins::ZERO,
            created_at: at,
            updated_at: at,
        }
    }
}

/// The thing being funded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRequest {
    pub id: RequestId,
    pub resource: ResourceId,
    pub owner: PrincipalId,
    pub title: String,
    pub body: String,
    pub status: RequestStatus,
    pub total_committed: Coins,
    pub available_for_next_run: Coins,
    pub current_run_number: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A principal's pledge of coins to a funding request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: CommitmentId,
    pub request: RequestId,
    pub principal: PrincipalId,
    pub amount: Coins,
    pub remaining: Coins,
    /// Coins returned to the wallet by run rejections.
    pub refunded: Coins,
    pub status: AllocationStatus,
    /// Run that consumed the commitment, or the last run whose rejection refunded it.
    pub run: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// One attempt at performing the funded work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub request: RequestId,
    pub run_number: u32,
    pub status: RunStatus,
    pub coins_consumed: Coins,
    pub triggered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub artifact_url: Option<String>,
    pub result_payload: Option<Value>,
}

/// Coins taken from one commitment to fund one run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub run: RunId,
    pub commitment: CommitmentId,
    pub principal: PrincipalId,
    pub amount: Coins,
    pub created_at: DateTime<Utc>,
    pub reversed_at: Option<DateTime<Utc>>,
}

impl Commitment {
    /// Coins drawn by runs so far.
    pub fn consumed(&self) -> Coins {
        Coins(self.amount.0.saturating_sub(self.remaining.0))
    }

    pub fn is_allocatable(&self) -> bool {
        !self.remaining.is_zero() && self.status != AllocationStatus::Refunded
    }
}

impl Allocation {
    pub fn is_reversed(&self) -> bool {
        self.reversed_at.is_some()
    }
}

/// Resolved view of a target resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub name: String,
    pub maintainer: PrincipalId,
}

/// Pre-validated price reference attached to a purchase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRef {
    pub reference: String,
    pub usd_cents: Option<u64>,
}

impl PriceRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            usd_cents: None,
        }
    }

    pub fn with_usd_cents(mut self, cents: u64) -> Self {
        self.usd_cents = Some(cents);
        self
    }
}

/// Executor report attached to a completed run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: String,
    pub artifact_url: Option<String>,
    pub result_payload: Option<Value>,
}

impl RunReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, url: impl Into<String>) -> Self {
        self.artifact_url = Some(url.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.result_payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_requests_refuse_commitments() {
        assert!(RequestStatus::Approved.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Closed.is_terminal());
        assert!(!RequestStatus::AwaitingReview.is_terminal());
    }

    #[test]
    fn statuses_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::RerunRequested).unwrap(),
            serde_json::json!("rerun_requested")
        );
        assert_eq!(
            serde_json::to_value(RequestStatus::AwaitingReview).unwrap(),
            serde_json::json!("awaiting_review")
        );
        assert_eq!(
            serde_json::to_value(AllocationStatus::ConsumedByRun).unwrap(),
            serde_json::json!("consumed_by_run")
        );
    }

    #[test]
    fn only_queued_and_running_are_active() {
        assert!(RunStatus::Queued.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Completed.is_active());
        assert!(!RunStatus::RerunRequested.is_active());
    }

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(RunId(7).to_string(), "run-7");
        assert_eq!(CommitmentId(3).next(), CommitmentId(4));
    }
}
