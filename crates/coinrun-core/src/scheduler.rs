//! Run lifecycle: `queued -> running -> completed -> {approved, rerun_requested, rejected}`.

use crate::audit::{actions, AuditRefs, EXECUTOR_ACTOR};
use crate::error::FundingError;
use crate::ledger::LedgerRef;
use crate::state::FundingTxn;
use crate::types::{
    AllocationStatus, Coins, FundingRequest, PrincipalId, RequestStatus, Run, RunId, RunReport,
    RunStatus,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

/// State after a reviewer action.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub run: Run,
    pub request: FundingRequest,
    pub refunded: Coins,
    pub triggered_runs: Vec<Run>,
}

fn authorize(reviewer: &PrincipalId, maintainer: Option<&PrincipalId>) -> Result<(), FundingError> {
    match maintainer {
        Some(maintainer) if maintainer == reviewer => Ok(()),
        _ => Err(FundingError::MaintainerAccessRequired(reviewer.clone())),
    }
}

impl FundingTxn<'_> {
    /// Executor picked up the run. Anything but `queued` is left as is.
    pub fn start_run(&mut self, run_id: RunId) -> Result<Run, FundingError> {
        let mut run = self.require_run(run_id)?;
        if run.status != RunStatus::Queued {
            return Ok(run);
        }

        let now = self.now();
        run.status = RunStatus::Running;
        run.started_at = Some(now);
        self.put_run(run.clone());
        self.set_request_status(&run, RequestStatus::InProgress)?;
        self.record(
            EXECUTOR_ACTOR,
            actions::RUN_STARTED,
            AuditRefs::run(run.request, run.id),
            json!({ "runNumber": run.run_number }),
        )?;
        Ok(run)
    }

    /// Executor finished the run and reported back.
    pub fn complete_run(&mut self, run_id: RunId, report: RunReport) -> Result<Run, FundingError> {
        let mut run = self.require_run(run_id)?;
        if run.status == RunStatus::Completed {
            return Ok(run);
        }
        if !run.status.is_active() {
            return Err(FundingError::InvalidRunTransition {
                run: run_id,
                from: run.status,
                to: RunStatus::Completed,
            });
        }
        let summary = report.summary.trim();
        if summary.is_empty() {
            return Err(FundingError::validation("run summary must not be empty"));
        }

        let now = self.now();
        run.status = RunStatus::Completed;
        run.started_at = run.started_at.or(Some(now));
        run.completed_at = Some(now);
        run.summary = Some(summary.to_string());
        run.artifact_url = report.artifact_url;
        run.result_payload = report.result_payload;
        self.put_run(run.clone());
        self.set_request_status(&run, RequestStatus::AwaitingReview)?;
        self.record(
            EXECUTOR_ACTOR,
            actions::RUN_COMPLETED,
            AuditRefs::run(run.request, run.id),
            json!({ "runNumber": run.run_number, "artifactUrl": run.artifact_url }),
        )?;
        Ok(run)
    }

    /// Accept the run. Spent coins stay spent.
    pub fn approve_run(
        &mut self,
        reviewer: &PrincipalId,
        maintainer: Option<&PrincipalId>,
        run_id: RunId,
    ) -> Result<ReviewOutcome, FundingError> {
        authorize(reviewer, maintainer)?;
        let mut run = self.require_run(run_id)?;
        if run.status == RunStatus::Approved {
            return self.review_outcome(run, Coins::ZERO, Vec::new());
        }
        self.ensure_reviewable(&run)?;

        run.status = RunStatus::Approved;
        run.reviewed_at = Some(self.now());
        self.put_run(run.clone());
        self.settle_request(&run, RequestStatus::Approved)?;
        self.record(
            reviewer.as_str(),
            actions::RUN_APPROVED,
            AuditRefs::run(run.request, run.id),
            json!({ "runNumber": run.run_number }),
        )?;
        info!(run = %run.id, reviewer = %reviewer, "run approved");
        self.review_outcome(run, Coins::ZERO, Vec::new())
    }

    /// Reject the run and refund exactly the allocations that funded it.
    pub fn reject_run(
        &mut self,
        reviewer: &PrincipalId,
        maintainer: Option<&PrincipalId>,
        run_id: RunId,
    ) -> Result<ReviewOutcome, FundingError> {
        authorize(reviewer, maintainer)?;
        let mut run = self.require_run(run_id)?;
        if run.status == RunStatus::Rejected {
            return self.review_outcome(run, Coins::ZERO, Vec::new());
        }
        self.ensure_reviewable(&run)?;

        let now = self.now();
        let mut refunded = Coins::ZERO;
        for mut allocation in self.allocations_for_run(run_id) {
            if allocation.is_reversed() {
                continue;
            }
            self.reverse(
                &allocation.principal,
                allocation.amount,
                LedgerRef::commitment(run.request, allocation.commitment).with_run(run_id),
            )?;

            let mut commitment = self
                .commitment(allocation.commitment)
                .cloned()
                .ok_or_else(|| {
                    FundingError::LedgerInvariantViolation(format!(
                        "{} points at a missing commitment",
                        allocation.id
                    ))
                })?;
            commitment.refunded = commitment
                .refunded
                .checked_add(allocation.amount)
                .ok_or_else(|| {
                    FundingError::LedgerInvariantViolation("refund counter overflow".into())
                })?;
            // Coins still reserved on the commitment stay allocatable.
            if commitment.remaining.is_zero() {
                commitment.status = AllocationStatus::Refunded;
            }
            commitment.run = Some(run_id);
            commitment.refunded_at = Some(now);
            self.put_commitment(commitment);

            refunded = refunded.checked_add(allocation.amount).ok_or_else(|| {
                FundingError::LedgerInvariantViolation("refund total overflow".into())
            })?;
            allocation.reversed_at = Some(now);
            self.put_allocation(allocation);
        }

        run.status = RunStatus::Rejected;
        run.reviewed_at = Some(now);
        self.put_run(run.clone());
        self.settle_request(&run, RequestStatus::Rejected)?;
        self.record(
            reviewer.as_str(),
            actions::RUN_REJECTED,
            AuditRefs::run(run.request, run.id),
            json!({ "refundedCoins": refunded.0 }),
        )?;
        info!(run = %run.id, reviewer = %reviewer, refunded = refunded.0, "run rejected");
        self.review_outcome(run, refunded, Vec::new())
    }

    /// Send the run back and reopen the request to new funding.
    pub fn request_rerun(
        &mut self,
        reviewer: &PrincipalId,
        maintainer: Option<&PrincipalId>,
        run_id: RunId,
    ) -> Result<ReviewOutcome, FundingError> {
        authorize(reviewer, maintainer)?;
        let mut run = self.require_run(run_id)?;
        if !run.status.is_reviewable() {
            return Err(FundingError::CannotRerun {
                run: run_id,
                status: run.status,
            });
        }

        run.status = RunStatus::RerunRequested;
        run.reviewed_at = run.reviewed_at.or(Some(self.now()));
        self.put_run(run.clone());
        self.settle_request(&run, RequestStatus::Open)?;
        self.record(
            reviewer.as_str(),
            actions::RUN_RERUN_REQUESTED,
            AuditRefs::run(run.request, run.id),
            json!({ "runNumber": run.run_number }),
        )?;

        let triggered = self.allocate_until_blocked(run.request)?;
        self.review_outcome(run, Coins::ZERO, triggered)
    }

    fn ensure_reviewable(&self, run: &Run) -> Result<(), FundingError> {
        if run.status.is_reviewable() {
            Ok(())
        } else {
            Err(FundingError::NotReviewable {
                run: run.id,
                status: run.status,
            })
        }
    }

    /// Apply a review outcome to the request. A run superseded by a newer
    /// run still settles its own coins but leaves the request to the newer run.
    fn settle_request(&mut self, run: &Run, status: RequestStatus) -> Result<(), FundingError> {
        let request = self.require_request(run.request)?;
        if request.current_run_number != run.run_number {
            return Ok(());
        }
        self.set_request_status(run, status)
    }

    fn set_request_status(&mut self, run: &Run, status: RequestStatus) -> Result<(), FundingError> {
        let mut request = self.require_request(run.request)?;
        request.status = status;
        request.updated_at = self.now();
        self.put_request(request);
        Ok(())
    }

    fn review_outcome(
        &self,
        run: Run,
        refunded: Coins,
        triggered_runs: Vec<Run>,
    ) -> Result<ReviewOutcome, FundingError> {
        Ok(ReviewOutcome {
            request: self.require_request(run.request)?,
            run,
            refunded,
            triggered_runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FundingPolicy;
    use crate::state::FundingState;
    use crate::types::{RequestId, ResourceId, ResourceRecord};
    use chrono::Utc;

    fn p(name: &str) -> PrincipalId {
        PrincipalId::new(name)
    }

    /// Owner plus one funder, with one run of the request already completed.
    fn completed_run() -> FundingState {
        let base = FundingState::default();
        let mut txn = FundingTxn::begin(&base, FundingPolicy::default(), Utc::now());
        txn.onboard_principal("owner", "owner@example.com").unwrap();
        txn.onboard_principal("alice", "alice@example.com").unwrap();
        let resource = ResourceRecord {
            id: ResourceId::new("demo"),
            name: "Demo".into(),
            maintainer: p("owner"),
        };
        txn.submit_funding_request(
            &p("owner"),
            &resource,
            "Fix the build",
            "The nightly build is red.",
        )
        .unwrap();
        txn.commit(&p("alice"), RequestId(1), Coins(10)).unwrap();
        txn.start_run(RunId(1)).unwrap();
        txn.complete_run(RunId(1), RunReport::new("done")).unwrap();
        FundingState::from_changeset(txn.into_changeset())
    }

    #[test]
    fn executor_transitions_move_request_along() {
        let state = completed_run();
        assert_eq!(state.run(RunId(1)).unwrap().status, RunStatus::Completed);
        assert_eq!(
            state.request(RequestId(1)).unwrap().status,
            RequestStatus::AwaitingReview
        );
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let again = txn.complete_run(RunId(1), RunReport::new("again")).unwrap();
        assert_eq!(again.summary.as_deref(), Some("done"));
        assert!(txn.staged_audit().is_empty());
    }

    #[test]
    fn reviewer_must_be_maintainer() {
        let state = completed_run();
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let owner = p("owner");
        assert!(matches!(
            txn.approve_run(&p("alice"), Some(&owner), RunId(1)),
            Err(FundingError::MaintainerAccessRequired(_))
        ));
        assert!(matches!(
            txn.reject_run(&owner, None, RunId(1)),
            Err(FundingError::MaintainerAccessRequired(_))
        ));
    }

    #[test]
    fn reject_refunds_and_is_idempotent() {
        let state = completed_run();
        let owner = p("owner");
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let outcome = txn.reject_run(&owner, Some(&owner), RunId(1)).unwrap();
        assert_eq!(outcome.refunded, Coins(10));
        assert_eq!(outcome.request.status, RequestStatus::Rejected);
        assert_eq!(txn.wallet(&p("alice")).unwrap().available, Coins(50));

        let audit_len = txn.staged_audit().len();
        let repeat = txn.reject_run(&owner, Some(&owner), RunId(1)).unwrap();
        assert_eq!(repeat.refunded, Coins::ZERO);
        assert_eq!(txn.staged_audit().len(), audit_len);
        assert_eq!(txn.wallet(&p("alice")).unwrap().available, Coins(50));
    }

    #[test]
    fn queued_run_is_not_reviewable() {
        let base = FundingState::default();
        let mut txn = FundingTxn::begin(&base, FundingPolicy::default(), Utc::now());
        txn.onboard_principal("owner", "owner@example.com").unwrap();
        let resource = ResourceRecord {
            id: ResourceId::new("demo"),
            name: "Demo".into(),
            maintainer: p("owner"),
        };
        txn.submit_funding_request(
            &p("owner"),
            &resource,
            "Fix the build",
            "The nightly build is red.",
        )
        .unwrap();
        txn.commit(&p("owner"), RequestId(1), Coins(10)).unwrap();
        let owner = p("owner");
        assert!(matches!(
            txn.approve_run(&owner, Some(&owner), RunId(1)),
            Err(FundingError::NotReviewable { .. })
        ));
        assert!(matches!(
            txn.request_rerun(&owner, Some(&owner), RunId(1)),
            Err(FundingError::CannotRerun { .. })
        ));
    }

    #[test]
    fn rerun_keeps_first_review_timestamp() {
        let state = completed_run();
        let owner = p("owner");
        let mut txn = FundingTxn::begin(&state, FundingPolicy::default(), Utc::now());
        let first = txn.request_rerun(&owner, Some(&owner), RunId(1)).unwrap();
        assert_eq!(first.request.status, RequestStatus::Open);
        assert!(first.triggered_runs.is_empty());
        let second = txn.request_rerun(&owner, Some(&owner), RunId(1)).unwrap();
        assert_eq!(first.run.reviewed_at, second.run.reviewed_at);
    }
}
