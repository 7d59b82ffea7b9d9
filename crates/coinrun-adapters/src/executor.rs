use coinrun_core::{FundingEngine, FundingError, Run, RunId, RunReport};
use serde_json::json;
use tracing::info;

/// Stand-in for the agent that performs funded work.
///
/// Picks up every queued run, marks it running, and immediately reports a
/// structured result. No real work is done.
#[derive(Debug, Clone)]
pub struct SimulatedWorkExecutor {
    artifact_base: String,
}

impl Default for SimulatedWorkExecutor {
    fn default() -> Self {
        Self::new("/funding-requests")
    }
}

impl SimulatedWorkExecutor {
    pub fn new(artifact_base: impl Into<String>) -> Self {
        Self {
            artifact_base: artifact_base.into(),
        }
    }

    pub fn report_for(&self, run: &Run) -> RunReport {
        RunReport::new(format!(
            "Agent produced a first pass for funding request #{}. Review the result and either approve, fund a rerun, or reject for a refund.",
            run.request.0
        ))
        .with_artifact(format!(
            "{}/{}#run-{}",
            self.artifact_base.trim_end_matches('/'),
            run.request.0,
            run.id.0
        ))
        .with_payload(json!({
            "branch": format!("agent/run-{}", run.run_number),
            "note": "Simulated execution; the result is structured metadata rather than a real change.",
        }))
    }

    /// Process every queued run. Returns the ids of the runs completed.
    pub async fn drain(&self, engine: &FundingEngine) -> Result<Vec<RunId>, FundingError> {
        let mut processed = Vec::new();
        for run in engine.list_queued_runs().await {
            engine.start_run(run.id).await?;
            engine.complete_run(run.id, self.report_for(&run)).await?;
            processed.push(run.id);
        }
        if !processed.is_empty() {
            info!(runs = processed.len(), "simulated executor drained queue");
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalResourceRegistry;
    use coinrun_core::{Coins, EngineConfig, PrincipalId, RequestStatus, ResourceId, RunStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn drains_queued_runs_to_completed() {
        let registry = Arc::new(LocalResourceRegistry::in_memory());
        registry
            .register(
                "demo",
                "Demo",
                "A demonstration resource",
                PrincipalId::new("owner"),
            )
            .unwrap();
        let engine = FundingEngine::bootstrap(EngineConfig::default(), registry)
            .await
            .unwrap();
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
                "Please add the feature.",
            )
            .await
            .unwrap();
        engine
            .commit_coins(&owner, request.id, Coins(10))
            .await
            .unwrap();

        let executor = SimulatedWorkExecutor::default();
        let processed = executor.drain(&engine).await.unwrap();
        assert_eq!(processed.len(), 1);

        let run = engine.get_run(processed[0]).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.artifact_url.as_deref(),
            Some("/funding-requests/1#run-1")
        );
        assert_eq!(
            run.result_payload
                .as_ref()
                .and_then(|p| p["branch"].as_str()),
            Some("agent/run-1")
        );
        let details = engine
            .get_funding_request(request.id)
            .await
            .unwrap();
        assert_eq!(details.request.status, RequestStatus::AwaitingReview);

        assert!(executor.drain(&engine).await.unwrap().is_empty());
    }
}
