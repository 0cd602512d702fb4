//! # REST API
//!
//! The axum router exposing the engine's command surface. Handlers are thin:
//! they extract ids and bodies, call the [`Orchestrator`], and map
//! [`EngineError`]s to status codes by [`ErrorKind`].
//!
//! ## Endpoints
//!
//! | Method | Path                              | Command                     |
//! |--------|-----------------------------------|-----------------------------|
//! | GET    | `/health`                         | Liveness probe              |
//! | GET    | `/status`                         | Engine summary              |
//! | GET    | `/engine/public-key`              | Token verification key      |
//! | POST   | `/assets`                         | `upsert_asset`              |
//! | POST   | `/assets/sync`                    | `sync_balance`              |
//! | GET    | `/assets/:id`                     | Asset with free balance     |
//! | GET    | `/assets/:id/locks`               | Locks on an asset           |
//! | POST   | `/assets/:id/locks`               | `lock_balance`              |
//! | DELETE | `/locks/:id`                      | `unlock_balance`            |
//! | POST   | `/transfers/confirm`              | `confirm_transfer`          |
//! | GET    | `/assets/:id/proofs`              | Proofs over an asset        |
//! | POST   | `/proofs`                         | `request_proof`             |
//! | GET    | `/proofs/:id`                     | Proof record                |
//! | GET    | `/proofs/:id/status`              | Status without counting     |
//! | POST   | `/proofs/:id/verify`              | `verify_proof`              |
//! | POST   | `/proofs/:id/callback`            | Prover verdict              |
//! | POST   | `/proofs/:id/cancel`              | `cancel_proof`              |
//! | POST   | `/proofs/:id/resubmit`            | Re-issue a prover job       |
//! | POST   | `/credit-lines`                   | `open_credit_line`          |
//! | GET    | `/credit-lines/:id`               | Line with utilization       |
//! | PATCH  | `/credit-lines/:id`               | `edit_credit_line`          |
//! | POST   | `/credit-lines/:id/adjust`        | `adjust_used`               |
//! | POST   | `/credit-lines/:id/status`        | Pause / resume              |
//! | POST   | `/credit-lines/:id/close`         | `close`                     |
//! | POST   | `/agents`                         | `create_agent`              |
//! | GET    | `/agents/:id`                     | Agent config                |
//! | PATCH  | `/agents/:id`                     | `edit_agent`                |
//! | DELETE | `/agents/:id`                     | `delete_agent`              |
//! | POST   | `/agents/:id/activate`            | `activate`                  |
//! | POST   | `/agents/:id/status`              | `toggle_status`             |
//! | POST   | `/agents/:id/authorize`           | `authorize_spend`           |
//! | POST   | `/agents/:id/spend`               | Authorize and execute       |
//! | GET    | `/agents/:id/spend`               | Rolling spend               |
//! | GET    | `/agents/:id/spends`              | Spend history               |
//! | POST   | `/tokens/execute`                 | Redeem a token              |
//! | GET    | `/tokens/:id`                     | Token record                |
//! | GET    | `/users/:user_id/assets`          | Assets of a user            |
//! | GET    | `/users/:user_id/credit-lines`    | Credit lines of a user      |
//! | GET    | `/users/:user_id/agents`          | Agents of a user            |
//! | POST   | `/devnet/balances`                | Seed a devnet balance       |

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use zkredit_protocol::agent::{
    AgentConfig, AgentPatch, AgentStatus, AuthorizationToken, NewAgent, SpendEvent, TokenRecord,
};
use zkredit_protocol::collaborators::TxReference;
use zkredit_protocol::config::DAILY_WINDOW;
use zkredit_protocol::credit::{CreditLine, CreditLinePatch, CreditLineStatus, OpenCreditLine};
use zkredit_protocol::ledger::{Asset, AssetSnapshot, LockRequest, LockedBalance};
use zkredit_protocol::orchestrator::{EngineStats, ExecutedSpend, SyncBalance};
use zkredit_protocol::proof::{ProofRequest, ProverVerdict, VerificationResult, ZkProof};
use zkredit_protocol::types::{AssetId, ChainId};
use zkredit_protocol::{EngineError, ErrorKind, Orchestrator};

use crate::devnet::{DevBalance, DevChainConnector};
use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub engine: Arc<Orchestrator>,
    pub metrics: SharedMetrics,
    /// Present when the node runs against the in-process devnet chain.
    pub devnet: Option<Arc<DevChainConnector>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

/// An [`EngineError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PolicyViolation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ExternalCollaborator => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self.0, %kind, "request failed");
        } else {
            tracing::debug!(error = %self.0, %kind, "request refused");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the API router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/engine/public-key", get(public_key_handler))
        // ledger
        .route("/assets", post(upsert_asset_handler))
        .route("/assets/sync", post(sync_balance_handler))
        .route("/assets/:id", get(asset_handler))
        .route(
            "/assets/:id/locks",
            get(locks_handler).post(lock_balance_handler),
        )
        .route("/assets/:id/proofs", get(asset_proofs_handler))
        .route("/locks/:id", delete(unlock_balance_handler))
        .route("/transfers/confirm", post(confirm_transfer_handler))
        // proofs
        .route("/proofs", post(request_proof_handler))
        .route("/proofs/:id", get(proof_handler))
        .route("/proofs/:id/status", get(proof_status_handler))
        .route("/proofs/:id/verify", post(verify_proof_handler))
        .route("/proofs/:id/callback", post(prover_callback_handler))
        .route("/proofs/:id/cancel", post(cancel_proof_handler))
        .route("/proofs/:id/resubmit", post(resubmit_proof_handler))
        // credit
        .route("/credit-lines", post(open_credit_line_handler))
        .route(
            "/credit-lines/:id",
            get(credit_line_handler).patch(edit_credit_line_handler),
        )
        .route("/credit-lines/:id/adjust", post(adjust_credit_handler))
        .route("/credit-lines/:id/status", post(credit_line_status_handler))
        .route("/credit-lines/:id/close", post(close_credit_line_handler))
        // agents
        .route("/agents", post(create_agent_handler))
        .route(
            "/agents/:id",
            get(agent_handler)
                .patch(edit_agent_handler)
                .delete(delete_agent_handler),
        )
        .route("/agents/:id/activate", post(activate_agent_handler))
        .route("/agents/:id/status", post(toggle_agent_handler))
        .route("/agents/:id/authorize", post(authorize_handler))
        .route(
            "/agents/:id/spend",
            get(rolling_spend_handler).post(spend_handler),
        )
        .route("/agents/:id/spends", get(agent_spends_handler))
        .route("/tokens/execute", post(execute_token_handler))
        .route("/tokens/:id", get(token_handler))
        // per-user views
        .route("/users/:user_id/assets", get(user_assets_handler))
        .route("/users/:user_id/credit-lines", get(user_credit_lines_handler))
        .route("/users/:user_id/agents", get(user_agents_handler));

    if state.devnet.is_some() {
        router = router.route("/devnet/balances", post(devnet_balance_handler));
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response & Request Types
// ---------------------------------------------------------------------------

/// Response for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: i64,
    pub public_key: String,
    pub collateral_ratio_bps: u32,
    pub devnet: bool,
    pub stats: EngineStats,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssetView {
    #[serde(flatten)]
    pub asset: Asset,
    pub free_balance: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreditLineView {
    #[serde(flatten)]
    pub line: CreditLine,
    pub utilization_pct: f64,
    pub available: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmTransferBody {
    pub asset_id: AssetId,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdjustCreditBody {
    /// Positive draws, negative repays.
    pub delta: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody<S> {
    pub status: S,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeBody {
    pub amount: u64,
    pub chain_id: ChainId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpendBody {
    pub amount: u64,
    pub chain_id: ChainId,
    pub recipient: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteTokenBody {
    pub token: AuthorizationToken,
    pub recipient: String,
}

#[derive(Debug, Deserialize)]
pub struct SpendWindowQuery {
    /// Window length; the daily window when omitted.
    pub window_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RollingSpendResponse {
    pub window_secs: u64,
    pub spent: u64,
}

// ---------------------------------------------------------------------------
// Handlers: node
// ---------------------------------------------------------------------------

/// `GET /health`. Liveness only; engine details live under `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.engine.stats();
    state.metrics.observe_stats(&stats);
    let now = Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        uptime_secs: (now - state.started_at).num_seconds(),
        public_key: state.engine.public_key().to_hex(),
        collateral_ratio_bps: state.engine.config().collateral_ratio_bps,
        devnet: state.devnet.is_some(),
        stats,
        timestamp: now.to_rfc3339(),
    })
}

async fn public_key_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "public_key": state.engine.public_key().to_hex() }))
}

// ---------------------------------------------------------------------------
// Handlers: ledger
// ---------------------------------------------------------------------------

async fn upsert_asset_handler(
    State(state): State<AppState>,
    Json(snapshot): Json<AssetSnapshot>,
) -> ApiResult<Asset> {
    Ok(Json(state.engine.upsert_asset(snapshot)?))
}

async fn sync_balance_handler(
    State(state): State<AppState>,
    Json(request): Json<SyncBalance>,
) -> ApiResult<Asset> {
    Ok(Json(state.engine.sync_balance(request).await?))
}

async fn asset_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<AssetView> {
    let asset = state.engine.asset(&id)?;
    let free_balance = state.engine.free_balance(&id)?;
    Ok(Json(AssetView {
        asset,
        free_balance,
    }))
}

async fn locks_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<Vec<LockedBalance>> {
    Ok(Json(state.engine.locks_for_asset(&id)?))
}

async fn lock_balance_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> Result<(StatusCode, Json<LockedBalance>), ApiError> {
    let lock = state.engine.lock_balance(&id, request)?;
    Ok((StatusCode::CREATED, Json(lock)))
}

async fn unlock_balance_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<LockedBalance> {
    Ok(Json(state.engine.unlock_balance(&id)?))
}

async fn confirm_transfer_handler(
    State(state): State<AppState>,
    Json(body): Json<ConfirmTransferBody>,
) -> ApiResult<Asset> {
    Ok(Json(state.engine.confirm_transfer(&body.asset_id, body.amount)?))
}

async fn asset_proofs_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<Vec<ZkProof>> {
    state.engine.asset(&id)?;
    Ok(Json(state.engine.proofs_for_asset(&id)))
}

// ---------------------------------------------------------------------------
// Handlers: proofs
// ---------------------------------------------------------------------------

async fn request_proof_handler(
    State(state): State<AppState>,
    Json(request): Json<ProofRequest>,
) -> Result<(StatusCode, Json<ZkProof>), ApiError> {
    let proof = state.engine.request_proof(&request)?;
    state.metrics.proofs_requested_total.inc();
    Ok((StatusCode::ACCEPTED, Json(proof)))
}

async fn proof_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<ZkProof> {
    Ok(Json(state.engine.proof(&id)?))
}

async fn proof_status_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<VerificationResult> {
    Ok(Json(state.engine.proof_status(&id)?))
}

async fn verify_proof_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<VerificationResult> {
    Ok(Json(state.engine.verify_proof(&id)?))
}

async fn prover_callback_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(verdict): Json<ProverVerdict>,
) -> ApiResult<ZkProof> {
    let proof = state.engine.prover_callback(&id, verdict)?;
    state.metrics.proofs_resolved_total.inc();
    Ok(Json(proof))
}

async fn cancel_proof_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<ZkProof> {
    Ok(Json(state.engine.cancel_proof(&id)?))
}

async fn resubmit_proof_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<ZkProof> {
    Ok(Json(state.engine.resubmit_proof(&id)?))
}

// ---------------------------------------------------------------------------
// Handlers: credit lines
// ---------------------------------------------------------------------------

fn credit_line_view(line: CreditLine) -> CreditLineView {
    CreditLineView {
        utilization_pct: line.utilization_pct(),
        available: line.available(),
        line,
    }
}

async fn open_credit_line_handler(
    State(state): State<AppState>,
    Json(request): Json<OpenCreditLine>,
) -> Result<(StatusCode, Json<CreditLineView>), ApiError> {
    let line = state.engine.open_credit_line(request)?;
    state.metrics.open_credit_lines.inc();
    Ok((
        StatusCode::CREATED,
        Json(credit_line_view(line)),
    ))
}

async fn credit_line_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<CreditLineView> {
    let line = state.engine.credit_line(&id)?;
    Ok(Json(credit_line_view(line)))
}

async fn edit_credit_line_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(patch): Json<CreditLinePatch>,
) -> ApiResult<CreditLineView> {
    let line = state.engine.edit_credit_line(&id, patch)?;
    Ok(Json(credit_line_view(line)))
}

async fn adjust_credit_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<AdjustCreditBody>,
) -> ApiResult<CreditLineView> {
    let line = state.engine.adjust_credit(&id, body.delta)?;
    state.metrics.credit_adjustments_total.inc();
    Ok(Json(credit_line_view(line)))
}

async fn credit_line_status_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<StatusBody<CreditLineStatus>>,
) -> ApiResult<CreditLineView> {
    let line = state.engine.set_credit_line_status(&id, body.status)?;
    Ok(Json(credit_line_view(line)))
}

async fn close_credit_line_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<CreditLineView> {
    let line = state.engine.close_credit_line(&id)?;
    state.metrics.open_credit_lines.dec();
    Ok(Json(credit_line_view(line)))
}

// ---------------------------------------------------------------------------
// Handlers: agents
// ---------------------------------------------------------------------------

async fn create_agent_handler(
    State(state): State<AppState>,
    Json(request): Json<NewAgent>,
) -> Result<(StatusCode, Json<AgentConfig>), ApiError> {
    let agent = state.engine.create_agent(request)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn agent_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<AgentConfig> {
    Ok(Json(state.engine.agent(&id)?))
}

async fn edit_agent_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(patch): Json<AgentPatch>,
) -> ApiResult<AgentConfig> {
    Ok(Json(state.engine.edit_agent(&id, patch)?))
}

async fn delete_agent_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<AgentConfig> {
    Ok(Json(state.engine.delete_agent(&id)?))
}

async fn activate_agent_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<AgentConfig> {
    Ok(Json(state.engine.activate_agent(&id)?))
}

async fn toggle_agent_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<StatusBody<AgentStatus>>,
) -> ApiResult<AgentConfig> {
    Ok(Json(state.engine.toggle_agent(&id, body.status)?))
}

/// Runs `authorize_spend` under the latency histogram and counts the outcome.
fn authorize_observed(
    state: &AppState,
    agent_id: &Uuid,
    amount: u64,
    chain_id: ChainId,
) -> Result<AuthorizationToken, ApiError> {
    let timer = state.metrics.authorization_latency_seconds.start_timer();
    let result = state.engine.authorize_spend(agent_id, amount, chain_id);
    timer.observe_duration();

    match result {
        Ok(token) => {
            state.metrics.authorizations_granted_total.inc();
            Ok(token)
        }
        Err(e) => {
            state
                .metrics
                .authorizations_denied_total
                .with_label_values(&[e.kind().as_str()])
                .inc();
            Err(e.into())
        }
    }
}

async fn authorize_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<AuthorizeBody>,
) -> ApiResult<AuthorizationToken> {
    Ok(Json(authorize_observed(&state, &id, body.amount, body.chain_id)?))
}

async fn spend_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<SpendBody>,
) -> ApiResult<ExecutedSpend> {
    let token = authorize_observed(&state, &id, body.amount, body.chain_id)?;
    let tx = state
        .engine
        .execute_with_token(&token, body.recipient)
        .await?;
    state.metrics.transfers_executed_total.inc();
    Ok(Json(ExecutedSpend { token, tx }))
}

async fn rolling_spend_handler(
    Path(id): Path<Uuid>,
    Query(query): Query<SpendWindowQuery>,
    State(state): State<AppState>,
) -> ApiResult<RollingSpendResponse> {
    let window_secs = query.window_secs.unwrap_or(DAILY_WINDOW.as_secs());
    let window = i64::try_from(window_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| EngineError::Invalid(format!("window of {window_secs}s is too long")))?;
    let spent = state.engine.rolling_spend(&id, window)?;
    Ok(Json(RollingSpendResponse { window_secs, spent }))
}

async fn agent_spends_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<Vec<SpendEvent>> {
    Ok(Json(state.engine.agent_spends(&id)?))
}

async fn execute_token_handler(
    State(state): State<AppState>,
    Json(body): Json<ExecuteTokenBody>,
) -> ApiResult<TxReference> {
    let tx = state
        .engine
        .execute_with_token(&body.token, body.recipient)
        .await?;
    state.metrics.transfers_executed_total.inc();
    Ok(Json(tx))
}

async fn token_handler(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<TokenRecord> {
    Ok(Json(state.engine.token(&id)?))
}

// ---------------------------------------------------------------------------
// Handlers: per-user views
// ---------------------------------------------------------------------------

async fn user_assets_handler(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Vec<Asset>> {
    Json(state.engine.assets_for_user(&user_id))
}

async fn user_credit_lines_handler(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Vec<CreditLineView>> {
    let lines = state
        .engine
        .credit_lines_for_user(&user_id)
        .into_iter()
        .map(credit_line_view)
        .collect();
    Json(lines)
}

async fn user_agents_handler(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Vec<AgentConfig>> {
    Json(state.engine.agents_for_user(&user_id))
}

// ---------------------------------------------------------------------------
// Handlers: devnet
// ---------------------------------------------------------------------------

async fn devnet_balance_handler(
    State(state): State<AppState>,
    Json(seed): Json<DevBalance>,
) -> impl IntoResponse {
    match &state.devnet {
        Some(chain) => {
            chain.set_balance(seed.clone());
            (StatusCode::OK, Json(seed)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
