use crate::error::FundingError;
use crate::state::FundingTxn;
use crate::types::{RequestId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Actor recorded for transitions driven by the work executor.
pub const EXECUTOR_ACTOR: &str = "work-executor";

pub mod actions {
    pub const PRINCIPAL_ONBOARDED: &str = "principal.onboarded";
    pub const WALLET_GRANTED: &str = "wallet.granted";
    pub const WALLET_PURCHASED: &str = "wallet.purchased";
    pub const REQUEST_CREATED: &str = "funding_request.created";
    pub const REQUEST_COMMITTED: &str = "funding_request.committed";
    pub const RUN_QUEUED: &str = "run.queued";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_APPROVED: &str = "run.approved";
    pub const RUN_REJECTED: &str = "run.rejected";
    pub const RUN_RERUN_REQUESTED: &str = "run.rerun_requested";
}

/// Entities an audit entry points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditRefs {
    pub request: Option<RequestId>,
    pub run: Option<RunId>,
}

impl AuditRefs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn request(request: RequestId) -> Self {
        Self {
            request: Some(request),
            run: None,
        }
    }

    pub fn run(request: RequestId, run: RunId) -> Self {
        Self {
            request: Some(request),
            run: Some(run),
        }
    }
}

/// Append-only, hash-chained record of one logical action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entry_id: String,
    pub sequence: u64,
    pub trace_id: String,
    pub actor: String,
    pub action: String,
    pub request: Option<RequestId>,
    pub run: Option<RunId>,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

#[allow(clippy::too_many_arguments)]
fn compute_hash(
    sequence: u64,
    trace_id: &str,
    actor: &str,
    action: &str,
    request: Option<RequestId>,
    run: Option<RunId>,
    detail: &Value,
    timestamp: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "sequence": sequence,
        "trace_id": trace_id,
        "actor": actor,
        "action": action,
        "request": request,
        "run": run,
        "detail": detail,
        "timestamp": timestamp,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

pub fn verify_chain(entries: &[AuditEntry]) -> bool {
    let mut previous_hash: Option<String> = None;
    for (position, entry) in entries.iter().enumerate() {
        if entry.sequence != position as u64 + 1 || entry.previous_hash != previous_hash {
            return false;
        }
        let expected = compute_hash(
            entry.sequence,
            &entry.trace_id,
            &entry.actor,
            &entry.action,
            entry.request,
            entry.run,
            &entry.detail,
            entry.timestamp,
            entry.previous_hash.as_deref(),
        );
        if entry.hash != expected {
            return false;
        }
        previous_hash = Some(entry.hash.clone());
    }
    true
}

impl FundingTxn<'_> {
    /// Stage one audit entry. The engine never reads these back.
    pub fn record(
        &mut self,
        actor: &str,
        action: &str,
        refs: AuditRefs,
        detail: Value,
    ) -> Result<(), FundingError> {
        if actor.trim().is_empty() {
            return Err(FundingError::validation("audit actor must not be empty"));
        }
        if action.trim().is_empty() {
            return Err(FundingError::validation("audit action must not be empty"));
        }

        let sequence = self.next_audit_sequence();
        let previous_hash = self.last_audit_hash();
        let timestamp = self.now();
        let trace_id = self.trace_id().to_string();
        let hash = compute_hash(
            sequence,
            &trace_id,
            actor,
            action,
            refs.request,
            refs.run,
            &detail,
            timestamp,
            previous_hash.as_deref(),
        );

        self.push_audit(AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            sequence,
            trace_id,
            actor: actor.to_string(),
            action: action.to_string(),
            request: refs.request,
            run: refs.run,
            detail,
            timestamp,
            previous_hash,
            hash,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FundingPolicy;
    use crate::state::FundingState;
    use serde_json::json;

    #[test]
    fn chains_entries_across_commands() {
        let mut state = FundingState::default();
        for round in 0..3 {
            let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
            txn.record(
                "alice",
                actions::REQUEST_COMMITTED,
                AuditRefs::request(RequestId(1)),
                json!({ "round": round }),
            )
            .unwrap();
            let changes = txn.into_changeset();
            state.apply(changes);
        }

        let entries = state.audit_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[2].previous_hash.as_deref(),
            Some(entries[1].hash.as_str())
        );
        assert!(verify_chain(entries));
        assert_eq!(state.audit_for_request(RequestId(1)).len(), 3);
    }

    #[test]
    fn rejects_blank_actor_or_action() {
        let state = FundingState::default();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        assert!(txn
            .record(" ", actions::RUN_STARTED, AuditRefs::none(), Value::Null)
            .is_err());
        assert!(txn
            .record(EXECUTOR_ACTOR, "", AuditRefs::none(), Value::Null)
            .is_err());
        assert!(txn.staged_audit().is_empty());
    }

    #[test]
    fn edited_detail_is_detected() {
        let mut state = FundingState::default();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        txn.record(
            "bob",
            actions::RUN_REJECTED,
            AuditRefs::run(RequestId(1), RunId(1)),
            json!({ "refundedCoins": 10 }),
        )
        .unwrap();
        let changes = txn.into_changeset();
        state.apply(changes);

        let mut entries = state.audit_entries().to_vec();
        entries[0].detail = json!({ "refundedCoins": 0 });
        assert!(!verify_chain(&entries));
    }
}
