//! First-come-first-served conversion of partial commitments into fully funded runs.

use crate::audit::{actions, AuditRefs};
use crate::error::FundingError;
use crate::state::FundingTxn;
use crate::types::{
    Allocation, AllocationStatus, Coins, Commitment, CommitmentId, PrincipalId, RequestId,
    RequestStatus, Run, RunStatus,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

/// Coins one commitment contributes to one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationSlice {
    pub commitment: CommitmentId,
    pub principal: PrincipalId,
    pub amount: Coins,
}

/// Select exactly `threshold` coins from `commitments`, oldest first.
///
/// Commitments must be supplied in creation order. Refunded and exhausted
/// commitments are skipped. A shortfall means the request counters drifted
/// from the commitments and is reported as a fatal invariant violation.
pub fn plan_allocation<'c>(
    commitments: impl IntoIterator<Item = &'c Commitment>,
    threshold: Coins,
) -> Result<Vec<AllocationSlice>, FundingError> {
    let mut needed = threshold;
    let mut slices = Vec::new();

    for commitment in commitments {
        if needed.is_zero() {
            break;
        }
        if !commitment.is_allocatable() {
            continue;
        }
        let take = commitment.remaining.min(needed);
        needed = Coins(needed.0 - take.0);
        slices.push(AllocationSlice {
            commitment: commitment.id,
            principal: commitment.principal.clone(),
            amount: take,
        });
    }

    if !needed.is_zero() {
        return Err(FundingError::AllocationInvariantViolation(format!(
            "commitments fall {needed} short of the {threshold} run threshold"
        )));
    }
    Ok(slices)
}

impl FundingTxn<'_> {
    /// Create one run if the request is fundable and has no active run.
    pub fn try_allocate_run(&mut self, request_id: RequestId) -> Result<Option<Run>, FundingError> {
        let mut request = self.require_request(request_id)?;
        let threshold = self.policy().run_threshold;

        if request.status.is_terminal()
            || self.active_run(request_id).is_some()
            || request.available_for_next_run < threshold
        {
            return Ok(None);
        }

        let commitments = self.commitments_for(request_id);
        let plan = plan_allocation(&commitments, threshold).inspect_err(|err| {
            error!(
                request = %request_id,
                available = request.available_for_next_run.0,
                threshold = threshold.0,
                error = %err,
                "allocation invariant violated"
            );
        })?;

        let now = self.now();
        let run = Run {
            id: self.next_run_id(),
            request: request_id,
            run_number: request.current_run_number + 1,
            status: RunStatus::Queued,
            coins_consumed: threshold,
            triggered_at: now,
            started_at: None,
            completed_at: None,
            reviewed_at: None,
            summary: None,
            artifact_url: None,
            result_payload: None,
        };
        self.put_run(run.clone());

        for slice in &plan {
            let mut commitment = self
                .commitment(slice.commitment)
                .cloned()
                .ok_or_else(|| {
                    FundingError::AllocationInvariantViolation(format!(
                        "planned {} vanished",
                        slice.commitment
                    ))
                })?;
            let (id, remaining) = (commitment.id, commitment.remaining);
            commitment.remaining = remaining.checked_sub(slice.amount).ok_or_else(|| {
                FundingError::AllocationInvariantViolation(format!(
                    "{id} has only {remaining} remaining"
                ))
            })?;
            if commitment.remaining.is_zero() {
                commitment.status = AllocationStatus::ConsumedByRun;
                commitment.run = Some(run.id);
            }
            self.put_commitment(commitment);

            let allocation = Allocation {
                id: self.next_allocation_id(),
                run: run.id,
                commitment: slice.commitment,
                principal: slice.principal.clone(),
                amount: slice.amount,
                created_at: now,
                reversed_at: None,
            };
            self.put_allocation(allocation);
        }

        request.available_for_next_run = request
            .available_for_next_run
            .checked_sub(threshold)
            .ok_or_else(|| {
                FundingError::AllocationInvariantViolation(format!(
                    "{request_id} cannot cover {threshold}"
                ))
            })?;
        request.current_run_number = run.run_number;
        request.status = RequestStatus::Queued;
        request.updated_at = now;
        let owner = request.owner.clone();
        self.put_request(request);

        self.record(
            owner.as_str(),
            actions::RUN_QUEUED,
            AuditRefs::run(request_id, run.id),
            json!({
                "runNumber": run.run_number,
                "coinsConsumed": threshold.0,
                "allocations": plan,
            }),
        )?;

        info!(
            request = %request_id,
            run = %run.id,
            run_number = run.run_number,
            contributors = plan.len(),
            "run triggered"
        );
        Ok(Some(run))
    }

    /// Keep allocating until the request is no longer fundable.
    pub fn allocate_until_blocked(
        &mut self,
        request_id: RequestId,
    ) -> Result<Vec<Run>, FundingError> {
        let mut triggered = Vec::new();
        while let Some(run) = self.try_allocate_run(request_id)? {
            triggered.push(run);
        }
        Ok(triggered)
    }
}
