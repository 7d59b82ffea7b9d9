use crate::audit::AuditEntry;
use crate::clock::{Clock, SystemClock};
use crate::commitments::CommitOutcome;
use crate::config::{EngineConfig, FundingPolicy};
use crate::error::FundingError;
use crate::ledger::LedgerEntry;
use crate::registry::ResourceRegistry;
use crate::scheduler::ReviewOutcome;
use crate::state::{FundingState, FundingTxn, IntegrityReport};
use crate::storage::StateStore;
use crate::types::{
    Allocation, Coins, Commitment, FundingRequest, PriceRef, PrincipalId, RequestId, ResourceId,
    Run, RunId, RunReport, Wallet,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Audit entries returned with request details.
pub const REQUEST_AUDIT_WINDOW: usize = 20;

/// Request with everything that hangs off it.
#[derive(Debug, Clone, Serialize)]
pub struct FundingRequestDetails {
    pub request: FundingRequest,
    /// Oldest first.
    pub commitments: Vec<Commitment>,
    /// Newest first.
    pub runs: Vec<Run>,
    pub allocations: Vec<Allocation>,
    /// Newest first.
    pub audit: Vec<AuditEntry>,
}

struct EngineInner {
    state: FundingState,
    store: StateStore,
}

/// Funding ledger and run scheduler.
///
/// Mutating commands are serialized behind one writer lock. Each runs as a
/// staged [`FundingTxn`]; its changeset is persisted and then applied, or
/// dropped entirely on error.
pub struct FundingEngine {
    policy: FundingPolicy,
    inner: RwLock<EngineInner>,
    registry: Arc<dyn ResourceRegistry>,
    clock: Arc<dyn Clock>,
}

impl FundingEngine {
    pub async fn bootstrap(
        config: EngineConfig,
        registry: Arc<dyn ResourceRegistry>,
    ) -> Result<Self, FundingError> {
        config.policy.validate()?;
        let (store, state) = StateStore::bootstrap(&config.storage).await?;
        info!(
            backend = store.label(),
            run_threshold = config.policy.run_threshold.0,
            starter_grant = config.policy.starter_grant.0,
            "funding engine ready"
        );
        Ok(Self {
            policy: config.policy,
            inner: RwLock::new(EngineInner { state, store }),
            registry,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> FundingPolicy {
        self.policy
    }

    pub async fn backend_label(&self) -> &'static str {
        self.inner.read().await.store.label()
    }

    // --- ledger commands ---

    pub async fn onboard_principal(
        &self,
        username: &str,
        email: &str,
    ) -> Result<Wallet, FundingError> {
        let wallet = self
            .execute("onboard_principal", |txn| {
                txn.onboard_principal(username, email)
            })
            .await?;
        info!(principal = %wallet.principal, available = wallet.available.0, "principal onboarded");
        Ok(wallet)
    }

    pub async fn grant_coins(
        &self,
        principal: &PrincipalId,
        amount: Coins,
        source: &str,
    ) -> Result<Wallet, FundingError> {
        let wallet = self
            .execute("grant_coins", |txn| {
                txn.grant_coins(principal, amount, source)
            })
            .await?;
        info!(principal = %principal, amount = amount.0, source, "coins granted");
        Ok(wallet)
    }

    pub async fn purchase_coins(
        &self,
        principal: &PrincipalId,
        amount: Coins,
        price: PriceRef,
    ) -> Result<Wallet, FundingError> {
        let reference = price.reference.clone();
        let wallet = self
            .execute("purchase_coins", |txn| {
                txn.purchase_coins(principal, amount, price)
            })
            .await?;
        info!(principal = %principal, amount = amount.0, price_ref = %reference, "coins purchased");
        Ok(wallet)
    }

    // --- funding commands ---

    pub async fn submit_funding_request(
        &self,
        owner: &PrincipalId,
        resource: &ResourceId,
        title: &str,
        body: &str,
    ) -> Result<FundingRequest, FundingError> {
        let record = self
            .registry
            .resolve(resource)
            .await
            .ok_or_else(|| FundingError::ResourceNotFound(resource.to_string()))?;
        let request = self
            .execute("submit_funding_request", |txn| {
                txn.submit_funding_request(owner, &record, title, body)
            })
            .await?;
        info!(
            request = %request.id,
            owner = %owner,
            resource = %resource,
            "funding request submitted"
        );
        Ok(request)
    }

    pub async fn commit_coins(
        &self,
        principal: &PrincipalId,
        request: RequestId,
        amount: Coins,
    ) -> Result<CommitOutcome, FundingError> {
        let outcome = self
            .execute("commit_coins", |txn| txn.commit(principal, request, amount))
            .await?;
        info!(
            principal = %principal,
            request = %request,
            amount = amount.0,
            available_for_next_run = outcome.request.available_for_next_run.0,
            triggered = outcome.triggered_runs.len(),
            "coins committed"
        );
        Ok(outcome)
    }

    // --- executor transitions ---

    pub async fn start_run(&self, run: RunId) -> Result<Run, FundingError> {
        self.execute("start_run", |txn| txn.start_run(run)).await
    }

    pub async fn complete_run(&self, run: RunId, report: RunReport) -> Result<Run, FundingError> {
        self.execute("complete_run", |txn| txn.complete_run(run, report))
            .await
    }

    // --- reviewer actions ---

    pub async fn approve_run(
        &self,
        reviewer: &PrincipalId,
        run: RunId,
    ) -> Result<ReviewOutcome, FundingError> {
        let maintainer = self.maintainer_of(run).await?;
        self.execute("approve_run", |txn| {
            txn.approve_run(reviewer, maintainer.as_ref(), run)
        })
        .await
    }

    pub async fn reject_run(
        &self,
        reviewer: &PrincipalId,
        run: RunId,
    ) -> Result<ReviewOutcome, FundingError> {
        let maintainer = self.maintainer_of(run).await?;
        self.execute("reject_run", |txn| {
            txn.reject_run(reviewer, maintainer.as_ref(), run)
        })
        .await
    }

    pub async fn request_rerun(
        &self,
        reviewer: &PrincipalId,
        run: RunId,
    ) -> Result<ReviewOutcome, FundingError> {
        let maintainer = self.maintainer_of(run).await?;
        let outcome = self
            .execute("request_rerun", |txn| {
                txn.request_rerun(reviewer, maintainer.as_ref(), run)
            })
            .await?;
        info!(
            run = %run,
            reviewer = %reviewer,
            triggered = outcome.triggered_runs.len(),
            "rerun requested"
        );
        Ok(outcome)
    }

    /// Resolve the maintainer before taking the writer lock; the registry may await.
    async fn maintainer_of(&self, run: RunId) -> Result<Option<PrincipalId>, FundingError> {
        let resource = {
            let inner = self.inner.read().await;
            let run = inner.state.run(run).ok_or(FundingError::RunNotFound(run))?;
            inner
                .state
                .request(run.request)
                .map(|request| request.resource.clone())
                .ok_or(FundingError::RequestNotFound(run.request))?
        };
        Ok(self
            .registry
            .resolve(&resource)
            .await
            .map(|record| record.maintainer))
    }

    // --- reads ---

    pub async fn get_wallet(&self, principal: &PrincipalId) -> Result<Wallet, FundingError> {
        self.inner
            .read()
            .await
            .state
            .wallet(principal)
            .cloned()
            .ok_or_else(|| FundingError::PrincipalNotFound(principal.clone()))
    }

    /// Newest first.
    pub async fn wallet_entries(
        &self,
        principal: &PrincipalId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, FundingError> {
        let inner = self.inner.read().await;
        if inner.state.wallet(principal).is_none() {
            return Err(FundingError::PrincipalNotFound(principal.clone()));
        }
        Ok(inner
            .state
            .entries_for(principal)
            .into_iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    pub async fn get_funding_request(
        &self,
        id: RequestId,
    ) -> Result<FundingRequestDetails, FundingError> {
        let inner = self.inner.read().await;
        let state = &inner.state;
        let request = state
            .request(id)
            .cloned()
            .ok_or(FundingError::RequestNotFound(id))?;
        let runs: Vec<Run> = state.runs_for(id).into_iter().rev().cloned().collect();
        let allocations = runs
            .iter()
            .rev()
            .flat_map(|run| state.allocations_for_run(run.id))
            .cloned()
            .collect();
        Ok(FundingRequestDetails {
            request,
            commitments: state.commitments_for(id).into_iter().cloned().collect(),
            runs,
            allocations,
            audit: state
                .audit_for_request(id)
                .into_iter()
                .rev()
                .take(REQUEST_AUDIT_WINDOW)
                .cloned()
                .collect(),
        })
    }

    /// Newest first.
    pub async fn list_funding_requests(&self) -> Vec<FundingRequest> {
        self.inner
            .read()
            .await
            .state
            .requests()
            .rev()
            .cloned()
            .collect()
    }

    pub async fn get_run(&self, id: RunId) -> Result<Run, FundingError> {
        self.inner
            .read()
            .await
            .state
            .run(id)
            .cloned()
            .ok_or(FundingError::RunNotFound(id))
    }

    /// Queued runs waiting for the work executor, oldest first.
    pub async fn list_queued_runs(&self) -> Vec<Run> {
        self.inner
            .read()
            .await
            .state
            .queued_runs()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.inner.read().await.state.ledger_entries().to_vec()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.read().await.state.audit_entries().to_vec()
    }

    pub async fn verify_integrity(&self) -> IntegrityReport {
        self.inner.read().await.state.verify()
    }

    /// Run `op` in a staged transaction, persist its changeset, then apply it.
    async fn execute<T, F>(&self, command: &'static str, op: F) -> Result<T, FundingError>
    where
        F: FnOnce(&mut FundingTxn<'_>) -> Result<T, FundingError>,
    {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();

        let staged = {
            let mut txn = FundingTxn::begin(&inner.state, self.policy, now);
            op(&mut txn).map(|value| (value, txn.into_changeset()))
        };
        let (value, changes) = staged.inspect_err(|err| {
            if err.is_fatal() {
                error!(command, error = %err, "command aborted on invariant violation");
            } else {
                warn!(command, class = ?err.class(), error = %err, "command rejected");
            }
        })?;

        if let Err(err) = inner.store.persist(&changes).await {
            error!(
                command,
                trace_id = %changes.trace_id,
                error = %err,
                "changeset persistence failed"
            );
            return Err(err);
        }

        debug!(
            command,
            trace_id = %changes.trace_id,
            ledger_entries = changes.ledger_entries.len(),
            audit_entries = changes.audit_entries.len(),
            "changeset committed"
        );
        inner.state.apply(changes);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceRecord, RunStatus};
    use async_trait::async_trait;

    struct SingleResource;

    #[async_trait]
    impl ResourceRegistry for SingleResource {
        async fn resolve(&self, resource: &ResourceId) -> Option<ResourceRecord> {
            (resource.0 == "demo").then(|| ResourceRecord {
                id: resource.clone(),
                name: "Demo".to_string(),
                maintainer: PrincipalId::new("owner"),
            })
        }
    }

    async fn engine() -> FundingEngine {
        FundingEngine::bootstrap(EngineConfig::default(), Arc::new(SingleResource))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failed_command_leaves_no_trace() {
        let engine = engine().await;
        engine
            .onboard_principal("owner", "owner@example.com")
            .await
            .unwrap();
        let before = engine.ledger_entries().await.len();

        let err = engine
            .submit_funding_request(
                &PrincipalId::new("owner"),
                &ResourceId::new("missing"),
                "Add feature",
                "Some longer body text.",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FundingError::ResourceNotFound(_)));

        let err = engine
            .commit_coins(&PrincipalId::new("owner"), RequestId(1), Coins(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FundingError::RequestNotFound(_)));
        assert_eq!(engine.ledger_entries().await.len(), before);
        assert!(engine.verify_integrity().await.is_clean());
    }

    #[tokio::test]
    async fn reviewer_resolution_uses_registry() {
        let engine = engine().await;
        let owner = PrincipalId::new("owner");
        engine
            .onboard_principal("owner", "owner@example.com")
            .await
            .unwrap();
        engine
            .onboard_principal("alice", "alice@example.com")
            .await
            .unwrap();
        let request = engine
            .submit_funding_request(
                &owner,
                &ResourceId::new("demo"),
                "Add feature",
                "Some longer body text.",
            )
            .await
            .unwrap();
        let outcome = engine
            .commit_coins(&PrincipalId::new("alice"), request.id, Coins(10))
            .await
            .unwrap();
        let run = outcome.triggered_runs[0].id;
        engine
            .complete_run(run, RunReport::new("shipped"))
            .await
            .unwrap();

        let err = engine
            .approve_run(&PrincipalId::new("alice"), run)
            .await
            .unwrap_err();
        assert!(matches!(err, FundingError::MaintainerAccessRequired(_)));

        let approved = engine.approve_run(&owner, run).await.unwrap();
        assert_eq!(approved.run.status, RunStatus::Approved);
        assert!(matches!(
            engine.approve_run(&owner, RunId(99)).await,
            Err(FundingError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn details_order_and_window() {
        let engine = engine().await;
        let owner = PrincipalId::new("owner");
        engine
            .onboard_principal("owner", "owner@example.com")
            .await
            .unwrap();
        let request = engine
            .submit_funding_request(
                &owner,
                &ResourceId::new("demo"),
                "Add feature",
                "Some longer body text.",
            )
            .await
            .unwrap();
        for _ in 0..25 {
            engine
                .commit_coins(&owner, request.id, Coins(1))
                .await
                .unwrap();
        }

        let details = engine.get_funding_request(request.id).await.unwrap();
        assert_eq!(details.commitments.len(), 25);
        assert!(details.commitments[0].id < details.commitments[24].id);
        assert_eq!(details.runs.len(), 1);
        assert_eq!(details.allocations.len(), 10);
        assert_eq!(details.audit.len(), REQUEST_AUDIT_WINDOW);
        assert!(details.audit[0].sequence > details.audit[1].sequence);

        let entries = engine.wallet_entries(&owner, 3).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].sequence > entries[2].sequence);
    }
}
