use crate::audit::{actions, AuditRefs};
use crate::error::FundingError;
use crate::ledger::LedgerRef;
use crate::state::FundingTxn;
use crate::types::{
    AllocationStatus, Coins, Commitment, FundingRequest, PrincipalId, RequestId, RequestStatus,
    ResourceRecord, Run,
};
use crate::validate;
use serde::Serialize;
use serde_json::json;

/// State after a commitment and any runs it triggered.
#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    pub commitment: Commitment,
    pub request: FundingRequest,
    pub triggered_runs: Vec<Run>,
}

impl FundingTxn<'_> {
    /// Open a new request against an already resolved resource.
    pub fn submit_funding_request(
        &mut self,
        owner: &PrincipalId,
        resource: &ResourceRecord,
        title: &str,
        body: &str,
    ) -> Result<FundingRequest, FundingError> {
        if self.principal(owner).is_none() {
            return Err(FundingError::PrincipalNotFound(owner.clone()));
        }
        let title = validate::trimmed_len("title", title, 4, 120)?;
        let body = validate::trimmed_len("body", body, 10, 2000)?;

        let now = self.now();
        let request = FundingRequest {
            id: self.next_request_id(),
            resource: resource.id.clone(),
            owner: owner.clone(),
            title,
            body,
            status: RequestStatus::Open,
            total_committed: Coins::ZERO,
            available_for_next_run: Coins::ZERO,
            current_run_number: 0,
            created_at: now,
            updated_at: now,
        };
        self.put_request(request.clone());
        self.record(
            owner.as_str(),
            actions::REQUEST_CREATED,
            AuditRefs::request(request.id),
            json!({ "resource": resource.id, "title": request.title }),
        )?;
        Ok(request)
    }

    /// Debit the wallet, reserve the coins on the request, then allocate any runs now fundable.
    pub fn commit(
        &mut self,
        principal: &PrincipalId,
        request_id: RequestId,
        amount: Coins,
    ) -> Result<CommitOutcome, FundingError> {
        let cap = self.policy().max_commitment;
        if amount.is_zero() || amount > cap {
            return Err(FundingError::InvalidAmount(format!(
                "commitment must be between 1 and {} coins",
                cap.0
            )));
        }

        let mut request = self.require_request(request_id)?;
        if request.status.is_terminal() {
            return Err(FundingError::RequestClosed {
                request: request_id,
                status: request.status,
            });
        }

        let commitment_id = self.next_commitment_id();
        self.debit(
            principal,
            amount,
            LedgerRef::commitment(request_id, commitment_id),
        )?;

        let now = self.now();
        self.put_commitment(Commitment {
            id: commitment_id,
            request: request_id,
            principal: principal.clone(),
            amount,
            remaining: amount,
            refunded: Coins::ZERO,
            status: AllocationStatus::Reserved,
            run: None,
            created_at: now,
            refunded_at: None,
        });

        let overflow =
            || FundingError::InvalidAmount(format!("{request_id} counters would overflow"));
        request.total_committed = request
            .total_committed
            .checked_add(amount)
            .ok_or_else(overflow)?;
        request.available_for_next_run = request
            .available_for_next_run
            .checked_add(amount)
            .ok_or_else(overflow)?;
        request.updated_at = now;
        self.put_request(request);

        self.record(
            principal.as_str(),
            actions::REQUEST_COMMITTED,
            AuditRefs::request(request_id),
            json!({ "commitment": commitment_id, "amount": amount.0 }),
        )?;

        let triggered_runs = self.allocate_until_blocked(request_id)?;
        let commitment = self.commitment(commitment_id).cloned().ok_or_else(|| {
            FundingError::AllocationInvariantViolation(format!("{commitment_id} vanished"))
        })?;
        Ok(CommitOutcome {
            commitment,
            request: self.require_request(request_id)?,
            triggered_runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FundingPolicy;
    use crate::state::FundingState;
    use crate::types::{ResourceId, RunStatus};
    use chrono::Utc;

    fn seeded() -> FundingState {
        let base = FundingState::default();
        let mut txn = FundingTxn::begin(&base, FundingPolicy::default(), Utc::now());
        txn.onboard_principal("owner", "owner@example.com").unwrap();
        txn.onboard_principal("alice", "alice@example.com").unwrap();
        let resource = ResourceRecord {
            id: ResourceId::new("demo"),
            name: "Demo".into(),
            maintainer: PrincipalId::new("owner"),
        };
        txn.submit_funding_request(
            &PrincipalId::new("owner"),
            &resource,
            "Add dark mode",
            "Please add a dark theme toggle.",
        )
        .unwrap();
        FundingState::from_changeset(txn.into_changeset())
    }

    #[test]
    fn partial_commitment_reserves_without_run() {
        let state = seeded();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let outcome = txn
            .commit(&PrincipalId::new("alice"), RequestId(1), Coins(9))
            .unwrap();
        assert!(outcome.triggered_runs.is_empty());
        assert_eq!(outcome.request.available_for_next_run, Coins(9));
        assert_eq!(outcome.request.status, RequestStatus::Open);
        assert_eq!(outcome.commitment.status, AllocationStatus::Reserved);
    }

    #[test]
    fn large_commitment_funds_a_single_run_and_rolls_over() {
        let state = seeded();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let outcome = txn
            .commit(&PrincipalId::new("alice"), RequestId(1), Coins(25))
            .unwrap();
        assert_eq!(outcome.triggered_runs.len(), 1);
        assert_eq!(outcome.triggered_runs[0].status, RunStatus::Queued);
        assert_eq!(outcome.request.available_for_next_run, Coins(15));
        assert_eq!(outcome.request.status, RequestStatus::Queued);
        assert_eq!(outcome.commitment.remaining, Coins(15));
        assert_eq!(outcome.commitment.status, AllocationStatus::Reserved);
    }

    #[test]
    fn rejects_amount_outside_cap() {
        let state = seeded();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        for amount in [0, 10_001] {
            assert!(matches!(
                txn.commit(&PrincipalId::new("alice"), RequestId(1), Coins(amount)),
                Err(FundingError::InvalidAmount(_))
            ));
        }
        assert!(txn.staged_ledger().is_empty());
    }

    #[test]
    fn short_titles_are_rejected() {
        let state = seeded();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let resource = ResourceRecord {
            id: ResourceId::new("demo"),
            name: "Demo".into(),
            maintainer: PrincipalId::new("owner"),
        };
        assert!(matches!(
            txn.submit_funding_request(
                &PrincipalId::new("alice"),
                &resource,
                "no",
                "long enough body",
            ),
            Err(FundingError::Validation(_))
        ));
    }
}
