// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token checked via the `AuthBearer` extractor.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, CommandError};
use crate::exit::{MonitorExit, MonitorSnapshot};

const DEFAULT_TRADES_LIMIT: usize = 50;
const MAX_TRADES_LIMIT: usize = 500;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/positions", get(positions).post(open_position))
        .route("/api/v1/positions/:symbol/sell", post(sell_position))
        .route("/api/v1/monitors", get(monitors))
        .route("/api/v1/monitors/:symbol/stop", post(stop_monitor))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/errors", get(errors))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = match &self {
            CommandError::NotFound(_) => StatusCode::NOT_FOUND,
            CommandError::Conflict(_) => StatusCode::CONFLICT,
            CommandError::Invalid(_) => StatusCode::BAD_REQUEST,
            CommandError::Failed(_) => StatusCode::BAD_GATEWAY,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    account_mode: String,
    open_positions: usize,
    active_monitors: usize,
    uptime_secs: u64,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        account_mode: state.execution.account_mode().to_string(),
        open_positions: state.position_manager.get_open_positions().len(),
        active_monitors: state.registry.snapshot().len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_open_positions())
}

#[derive(Deserialize)]
struct OpenPositionRequest {
    symbol: String,
    quote_amount: Decimal,
}

async fn open_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenPositionRequest>,
) -> Result<impl IntoResponse, CommandError> {
    let position = state.open_position(&req.symbol, req.quote_amount).await?;
    info!(
        symbol = %position.symbol,
        entry_price = %position.entry_price,
        amount = %position.amount,
        "position opened via API"
    );
    Ok((StatusCode::CREATED, Json(position)))
}

async fn sell_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, CommandError> {
    let trade = state.sell_position(&symbol).await?;
    info!(
        symbol = %trade.symbol,
        sell_price = %trade.sell_price,
        reason = %trade.reason,
        "position sold via API"
    );
    Ok(Json(trade))
}

// =============================================================================
// Monitors (authenticated)
// =============================================================================

async fn monitors(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Json<Vec<MonitorSnapshot>> {
    Json(state.registry.snapshot())
}

#[derive(Serialize)]
struct StopResponse {
    symbol: String,
    outcome: &'static str,
}

async fn stop_monitor(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, CommandError> {
    let symbol = state.resolve_symbol(&symbol);
    let outcome = match state.registry.stop(&symbol).await {
        Some(MonitorExit::Cancelled) => "stopped",
        Some(MonitorExit::Sold(_)) => "sold",
        Some(MonitorExit::SellFailed(_)) => "sell_failed",
        None => {
            return Err(CommandError::NotFound(format!("no monitor running for {symbol}")));
        }
    };
    state.increment_version();
    warn!(symbol = %symbol, outcome, "monitor stopped via API — position is unguarded");
    Ok(Json(StopResponse { symbol, outcome }))
}

// =============================================================================
// Trade journal & errors (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<usize>,
}

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<TradesQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_TRADES_LIMIT).clamp(1, MAX_TRADES_LIMIT);
    Json(state.recent_trades(limit))
}

async fn errors(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_errors.read().clone())
}

// =============================================================================
// Tests
// =============================================================================
