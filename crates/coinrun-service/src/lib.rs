#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use coinrun_adapters::{
    CoinPack, CoinPackCatalog, LocalResourceRegistry, PricingError, RegisteredResource,
    RegistryError, SimulatedWorkExecutor,
};
use coinrun_core::{
    AuditEntry, Coins, CommitOutcome, EngineConfig, ErrorClass, FundingEngine, FundingError,
    FundingRequest, FundingRequestDetails, IntegrityReport, LedgerEntry, LedgerEntryKind,
    PrincipalId, RequestId, ResourceId, ReviewOutcome, Run, RunId, RunReport, Wallet,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// JSON file backing the resource registry; in-memory when unset.
    pub registry_path: Option<PathBuf>,
    pub engine: EngineConfig,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<FundingEngine>,
    pub registry: Arc<LocalResourceRegistry>,
    pub catalog: Arc<CoinPackCatalog>,
    pub executor: SimulatedWorkExecutor,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            registry_path,
            engine,
        } = config;
        let registry = Arc::new(match registry_path {
            Some(path) => LocalResourceRegistry::load(path)?,
            None => LocalResourceRegistry::in_memory(),
        });
        let engine = FundingEngine::bootstrap(engine, registry.clone())
            .await
            .map_err(ServiceError::Core)?;

        Ok(Self {
            engine: Arc::new(engine),
            registry,
            catalog: Arc::new(CoinPackCatalog::default()),
            executor: SimulatedWorkExecutor::default(),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/principals", post(onboard_principal))
        .route("/v1/principals/:id/wallet", get(get_wallet))
        .route("/v1/principals/:id/grants", post(grant_coins))
        .route("/v1/principals/:id/purchases", post(purchase_coins))
        .route("/v1/resources", get(list_resources).post(register_resource))
        .route("/v1/coin-packs", get(list_coin_packs))
        .route(
            "/v1/funding-requests",
            get(list_funding_requests).post(submit_funding_request),
        )
        .route("/v1/funding-requests/:id", get(get_funding_request))
        .route("/v1/funding-requests/:id/commitments", post(commit_coins))
        .route("/v1/runs/queued", get(list_queued_runs))
        .route("/v1/runs/:id", get(get_run))
        .route("/v1/runs/:id/start", post(start_run))
        .route("/v1/runs/:id/complete", post(complete_run))
        .route("/v1/runs/:id/approve", post(approve_run))
        .route("/v1/runs/:id/reject", post(reject_run))
        .route("/v1/runs/:id/rerun", post(request_rerun))
        .route("/v1/executor/drain", post(drain_executor))
        .route("/v1/ledger/entries", get(list_ledger_entries))
        .route("/v1/ledger/verify", get(verify_integrity))
        .route("/v1/audit/entries", get(list_audit_entries))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("funding engine error: {0}")]
    Core(#[from] FundingError),
    #[error("resource registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Http { status, .. } => *status,
            ApiError::Funding(err) => status_for_class(err.class()),
            ApiError::Registry(RegistryError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::DuplicateSlug(_)) => StatusCode::CONFLICT,
            ApiError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pricing(_) => StatusCode::BAD_REQUEST,
        }
    }
}

fn status_for_class(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::StateConflict => StatusCode::CONFLICT,
        ErrorClass::ResourceIntegrity => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Authorization => StatusCode::FORBIDDEN,
        ErrorClass::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorClass::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

fn positive_coins(amount: u64) -> Result<Coins, ApiError> {
    if amount == 0 {
        return Err(ApiError::bad_request("amount must be a positive whole number"));
    }
    Ok(Coins(amount))
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    backend: &'static str,
    run_threshold: u64,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "coinrun-service",
        backend: state.engine.backend_label().await,
        run_threshold: state.engine.policy().run_threshold.0,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct OnboardRequest {
    username: String,
    email: String,
}

async fn onboard_principal(
    State(state): State<ServiceState>,
    Json(body): Json<OnboardRequest>,
) -> Result<(StatusCode, Json<Wallet>), ApiError> {
    let wallet = state
        .engine
        .onboard_principal(&body.username, &body.email)
        .await?;
    Ok((StatusCode::CREATED, Json(wallet)))
}

#[derive(Debug, Clone, Deserialize)]
struct WalletQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct WalletResponse {
    wallet: Wallet,
    entries: Vec<LedgerEntry>,
}

async fn get_wallet(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<WalletQuery>,
) -> Result<Json<WalletResponse>, ApiError> {
    let principal = PrincipalId::new(id);
    let wallet = state.engine.get_wallet(&principal).await?;
    let entries = state
        .engine
        .wallet_entries(&principal, query.limit.unwrap_or(20).min(200))
        .await?;
    Ok(Json(WalletResponse { wallet, entries }))
}

#[derive(Debug, Clone, Deserialize)]
struct GrantRequest {
    amount: u64,
    source: String,
}

async fn grant_coins(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<GrantRequest>,
) -> Result<Json<Wallet>, ApiError> {
    let amount = positive_coins(body.amount)?;
    Ok(Json(
        state
            .engine
            .grant_coins(&PrincipalId::new(id), amount, &body.source)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct PurchaseRequest {
    pack: String,
}

async fn purchase_coins(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<Wallet>, ApiError> {
    let (amount, price) = state.catalog.resolve(&body.pack)?;
    Ok(Json(
        state
            .engine
            .purchase_coins(&PrincipalId::new(id), amount, price)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterResourceRequest {
    slug: String,
    name: String,
    description: String,
    maintainer: String,
}

async fn register_resource(
    State(state): State<ServiceState>,
    Json(body): Json<RegisterResourceRequest>,
) -> Result<(StatusCode, Json<RegisteredResource>), ApiError> {
    let maintainer = PrincipalId::new(body.maintainer);
    // Maintainers must be onboarded so they can review runs.
    state.engine.get_wallet(&maintainer).await?;
    let resource = state
        .registry
        .register(&body.slug, &body.name, &body.description, maintainer)?;
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn list_resources(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<RegisteredResource>>, ApiError> {
    Ok(Json(state.registry.list()?))
}

async fn list_coin_packs(State(state): State<ServiceState>) -> Json<Vec<CoinPack>> {
    Json(state.catalog.packs().to_vec())
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitRequest {
    owner: String,
    resource: String,
    title: String,
    body: String,
}

async fn submit_funding_request(
    State(state): State<ServiceState>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<FundingRequest>), ApiError> {
    let request = state
        .engine
        .submit_funding_request(
            &PrincipalId::new(body.owner),
            &ResourceId::new(body.resource),
            &body.title,
            &body.body,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_funding_requests(State(state): State<ServiceState>) -> Json<Vec<FundingRequest>> {
    Json(state.engine.list_funding_requests().await)
}

async fn get_funding_request(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
) -> Result<Json<FundingRequestDetails>, ApiError> {
    Ok(Json(state.engine.get_funding_request(RequestId(id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct CommitRequest {
    principal: String,
    amount: u64,
}

async fn commit_coins(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
    Json(body): Json<CommitRequest>,
) -> Result<Json<CommitOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .commit_coins(
                &PrincipalId::new(body.principal),
                RequestId(id),
                Coins(body.amount),
            )
            .await?,
    ))
}

async fn list_queued_runs(State(state): State<ServiceState>) -> Json<Vec<Run>> {
    Json(state.engine.list_queued_runs().await)
}

async fn get_run(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.engine.get_run(RunId(id)).await?))
}

async fn start_run(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.engine.start_run(RunId(id)).await?))
}

async fn complete_run(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
    Json(report): Json<RunReport>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.engine.complete_run(RunId(id), report).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewRequest {
    reviewer: String,
}

async fn approve_run(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<ReviewOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .approve_run(&PrincipalId::new(body.reviewer), RunId(id))
            .await?,
    ))
}

async fn reject_run(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<ReviewOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .reject_run(&PrincipalId::new(body.reviewer), RunId(id))
            .await?,
    ))
}

async fn request_rerun(
    Path(id): Path<u64>,
    State(state): State<ServiceState>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<ReviewOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .request_rerun(&PrincipalId::new(body.reviewer), RunId(id))
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct DrainResponse {
    processed: Vec<RunId>,
}

async fn drain_executor(
    State(state): State<ServiceState>,
) -> Result<Json<DrainResponse>, ApiError> {
    let processed = state.executor.drain(&state.engine).await?;
    Ok(Json(DrainResponse { processed }))
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerEntriesQuery {
    principal: Option<String>,
    trace_id: Option<String>,
    kind: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PageResponse<T> {
    backend: &'static str,
    total: usize,
    returned: usize,
    items: Vec<T>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<LedgerEntryKind>, ApiError> {
    match kind.map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) if value == "grant" => Ok(Some(LedgerEntryKind::Grant)),
        Some(value) if value == "purchase" => Ok(Some(LedgerEntryKind::Purchase)),
        Some(value) if value == "commit" => Ok(Some(LedgerEntryKind::Commit)),
        Some(value) if value == "refund" => Ok(Some(LedgerEntryKind::Refund)),
        Some(other) => Err(ApiError::bad_request(format!(
            "invalid kind '{}'; expected one of: grant, purchase, commit, refund",
            other
        ))),
    }
}

/// Order, offset and cap a full listing the same way for every log.
fn paginate<T>(
    mut items: Vec<T>,
    order: Option<&str>,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<(usize, Vec<T>), ApiError> {
    let order = order.unwrap_or("desc").to_ascii_lowercase();
    if order == "desc" {
        items.reverse();
    } else if order != "asc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{}'; expected asc or desc",
            order
        )));
    }
    let total = items.len();
    let page = items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(100).min(1000))
        .collect();
    Ok((total, page))
}

async fn list_ledger_entries(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerEntriesQuery>,
) -> Result<Json<PageResponse<LedgerEntry>>, ApiError> {
    let kind_filter = parse_kind_filter(query.kind.as_deref())?;
    let mut entries = state.engine.ledger_entries().await;

    if let Some(principal) = query.principal.as_deref() {
        entries.retain(|entry| entry.principal.as_str() == principal);
    }
    if let Some(trace_id) = query.trace_id.as_deref() {
        entries.retain(|entry| entry.trace_id == trace_id);
    }
    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }

    let (total, items) = paginate(entries, query.order.as_deref(), query.offset, query.limit)?;
    Ok(Json(PageResponse {
        backend: state.engine.backend_label().await,
        total,
        returned: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct AuditEntriesQuery {
    request: Option<u64>,
    run: Option<u64>,
    action: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

async fn list_audit_entries(
    State(state): State<ServiceState>,
    Query(query): Query<AuditEntriesQuery>,
) -> Result<Json<PageResponse<AuditEntry>>, ApiError> {
    let mut entries = state.engine.audit_entries().await;
    if let Some(request) = query.request {
        entries.retain(|entry| entry.request == Some(RequestId(request)));
    }
    if let Some(run) = query.run {
        entries.retain(|entry| entry.run == Some(RunId(run)));
    }
    if let Some(action) = query.action.as_deref() {
        entries.retain(|entry| entry.action == action);
    }

    let (total, items) = paginate(entries, query.order.as_deref(), query.offset, query.limit)?;
    Ok(Json(PageResponse {
        backend: state.engine.backend_label().await,
        total,
        returned: items.len(),
        items,
    }))
}

async fn verify_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<IntegrityReport>, ApiError> {
    let report = state.engine.verify_integrity().await;
    if report.is_clean() {
        Ok(Json(report))
    } else {
        Err(ApiError::Http {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("integrity check failed: {}", report.violations.join("; ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Body::from(payload.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn seed(app: &Router) -> u64 {
        for name in ["owner", "alice"] {
            let (status, _) = call(
                app,
                "POST",
                "/v1/principals",
                Some(json!({ "username": name, "email": format!("{name}@example.com") })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, _) = call(
            app,
            "POST",
            "/v1/resources",
            Some(json!({
                "slug": "test-repo",
                "name": "Test Repo",
                "description": "A test repository for testing",
                "maintainer": "owner"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, request) = call(
            app,
            "POST",
            "/v1/funding-requests",
            Some(json!({
                "owner": "owner",
                "resource": "test-repo",
                "title": "Add dark mode",
                "body": "Please add a dark theme toggle."
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        request["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn health_reports_memory_backend() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["run_threshold"], 10);
    }

    #[tokio::test]
    async fn full_flow_over_http() {
        let app = app().await;
        let request = seed(&app).await;

        let (status, outcome) = call(
            &app,
            "POST",
            &format!("/v1/funding-requests/{request}/commitments"),
            Some(json!({ "principal": "alice", "amount": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["request"]["status"], "queued");
        let run = outcome["triggered_runs"][0]["id"].as_u64().unwrap();

        let (_, queued) = call(&app, "GET", "/v1/runs/queued", None).await;
        assert_eq!(queued.as_array().unwrap().len(), 1);

        let (status, drained) = call(&app, "POST", "/v1/executor/drain", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(drained["processed"], json!([run]));

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/runs/{run}/approve"),
            Some(json!({ "reviewer": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, review) = call(
            &app,
            "POST",
            &format!("/v1/runs/{run}/reject"),
            Some(json!({ "reviewer": "owner" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["refunded"], 10);

        let (_, wallet) = call(&app, "GET", "/v1/principals/alice/wallet", None).await;
        assert_eq!(wallet["wallet"]["available"], 50);
        assert_eq!(wallet["entries"][0]["kind"], "refund");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/funding-requests/{request}/commitments"),
            Some(json!({ "principal": "alice", "amount": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, audit) = call(
            &app,
            "GET",
            &format!("/v1/audit/entries?request={request}&action=run.rejected"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audit["total"], 1);

        let (status, _) = call(&app, "GET", "/v1/ledger/verify", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn overspend_maps_to_unprocessable() {
        let app = app().await;
        let request = seed(&app).await;
        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/funding-requests/{request}/commitments"),
            Some(json!({ "principal": "alice", "amount": 51 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("insufficient balance"));
    }

    #[tokio::test]
    async fn purchases_resolve_coin_packs() {
        let app = app().await;
        seed(&app).await;
        let (status, wallet) = call(
            &app,
            "POST",
            "/v1/principals/alice/purchases",
            Some(json!({ "pack": "starter-100" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(wallet["available"], 150);
        assert_eq!(wallet["lifetime_purchased"], 100);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/principals/alice/purchases",
            Some(json!({ "pack": "mega-9000" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ledger_entries_endpoint_filters_and_validates() {
        let app = app().await;
        seed(&app).await;
        let (status, body) = call(
            &app,
            "GET",
            "/v1/ledger/entries?kind=grant&order=asc",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][0]["principal"], "owner");

        let (status, _) = call(&app, "GET", "/v1/ledger/entries?kind=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_resources_conflict_and_registry_persists() {
        let path = std::env::temp_dir()
            .join(format!("coinrun-service-{}", Uuid::new_v4()))
            .join("resources.json");
        let state = ServiceState::bootstrap(ServiceConfig {
            registry_path: Some(path.clone()),
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        let app = build_router(state);
        seed(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            "/v1/resources",
            Some(json!({
                "slug": "test-repo",
                "name": "Test Repo 2",
                "description": "Another test repository",
                "maintainer": "owner"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let reloaded = LocalResourceRegistry::load(&path).unwrap();
        assert_eq!(reloaded.list().unwrap().len(), 1);
    }
}
