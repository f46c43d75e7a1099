// =============================================================================
// REST Control API — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  This is the surface an external UI
// or CLI drives: bot CRUD and lifecycle, decision/trade history, and the
// data-plane statistics.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::bot::{average_entry_price, open_exposure_usd, Bot};
use crate::engine::Engine;
use crate::signals::SignalConfig;
use crate::types::BotStatus;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health & stats ──────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        // ── Bots ────────────────────────────────────────────────────
        .route("/api/v1/bots", get(list_bots).post(create_bot))
        .route(
            "/api/v1/bots/:id",
            get(get_bot).put(update_bot).delete(delete_bot),
        )
        .route("/api/v1/bots/:id/start", post(start_bot))
        .route("/api/v1/bots/:id/stop", post(stop_bot))
        .route("/api/v1/bots/:id/emergency-stop", post(emergency_stop))
        // ── History ─────────────────────────────────────────────────
        .route("/api/v1/bots/:id/decisions", get(bot_decisions))
        .route("/api/v1/bots/:id/trades", get(bot_trades))
        .route("/api/v1/decisions", get(recent_decisions))
        .route("/api/v1/errors", get(recent_errors))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Shared response helpers
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(msg: String) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg }))
}

fn not_found(msg: String) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: msg }))
}

/// A bot plus its computed aggregates, as the UI displays it.
#[derive(Serialize)]
struct BotView {
    #[serde(flatten)]
    bot: Bot,
    open_tranche_count: u32,
    open_exposure_usd: f64,
    average_entry_price: Option<f64>,
}

impl BotView {
    fn from_bot(bot: Bot) -> Self {
        let open_tranche_count = bot.open_tranche_count();
        let exposure = open_exposure_usd(&bot.tranches);
        let avg_entry = average_entry_price(&bot.tranches);
        Self {
            bot,
            open_tranche_count,
            open_exposure_usd: exposure,
            average_entry_price: avg_entry,
        }
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

// =============================================================================
// Health & stats
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn stats(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.stats())
}

// =============================================================================
// Bots
// =============================================================================

async fn list_bots(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let views: Vec<BotView> = engine
        .registry
        .list()
        .into_iter()
        .map(|h| BotView::from_bot(h.bot.read().clone()))
        .collect();
    Json(views)
}

/// Creation payload; optional fields fall back to the model defaults.
#[derive(Deserialize)]
struct CreateBotRequest {
    name: String,
    pair: String,
    #[serde(default)]
    position_size_usd: Option<f64>,
    #[serde(default)]
    max_positions: Option<u32>,
    #[serde(default)]
    stop_loss_pct: Option<f64>,
    #[serde(default)]
    take_profit_pct: Option<f64>,
    #[serde(default)]
    cooldown_minutes: Option<f64>,
    #[serde(default)]
    trade_step_pct: Option<f64>,
    #[serde(default)]
    signal_config: Option<SignalConfig>,
}

async fn create_bot(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateBotRequest>,
) -> impl IntoResponse {
    let mut bot = Bot::new(req.name, req.pair);
    if let Some(v) = req.position_size_usd {
        bot.position_size_usd = v;
    }
    if let Some(v) = req.max_positions {
        bot.max_positions = v;
    }
    if let Some(v) = req.stop_loss_pct {
        bot.stop_loss_pct = v;
    }
    if let Some(v) = req.take_profit_pct {
        bot.take_profit_pct = v;
    }
    if let Some(v) = req.cooldown_minutes {
        bot.cooldown_minutes = v;
    }
    if let Some(v) = req.trade_step_pct {
        bot.trade_step_pct = v;
    }
    if let Some(v) = req.signal_config {
        bot.signal_config = v;
    }

    match engine.create_bot(bot).await {
        Ok(bot) => (StatusCode::CREATED, Json(BotView::from_bot(bot))).into_response(),
        Err(msg) => bad_request(msg).into_response(),
    }
}

async fn get_bot(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.registry.get(id) {
        Some(handle) => Json(BotView::from_bot(handle.bot.read().clone())).into_response(),
        None => not_found(format!("no bot with id {id}")).into_response(),
    }
}

/// Update payload: full replacement of the mutable configuration.
#[derive(Deserialize)]
struct UpdateBotRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    position_size_usd: Option<f64>,
    #[serde(default)]
    max_positions: Option<u32>,
    #[serde(default)]
    stop_loss_pct: Option<f64>,
    #[serde(default)]
    take_profit_pct: Option<f64>,
    #[serde(default)]
    cooldown_minutes: Option<f64>,
    #[serde(default)]
    trade_step_pct: Option<f64>,
    #[serde(default)]
    signal_config: Option<SignalConfig>,
}

async fn update_bot(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBotRequest>,
) -> impl IntoResponse {
    let Some(handle) = engine.registry.get(id) else {
        return not_found(format!("no bot with id {id}")).into_response();
    };

    let mut bot = handle.bot.read().clone();
    if let Some(v) = req.name {
        bot.name = v;
    }
    if let Some(v) = req.position_size_usd {
        bot.position_size_usd = v;
    }
    if let Some(v) = req.max_positions {
        bot.max_positions = v;
    }
    if let Some(v) = req.stop_loss_pct {
        bot.stop_loss_pct = v;
    }
    if let Some(v) = req.take_profit_pct {
        bot.take_profit_pct = v;
    }
    if let Some(v) = req.cooldown_minutes {
        bot.cooldown_minutes = v;
    }
    if let Some(v) = req.trade_step_pct {
        bot.trade_step_pct = v;
    }
    if let Some(v) = req.signal_config {
        bot.signal_config = v;
    }

    match engine.update_bot(bot).await {
        Ok(bot) => Json(BotView::from_bot(bot)).into_response(),
        Err(msg) => bad_request(msg).into_response(),
    }
}

async fn delete_bot(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.delete_bot(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(msg) => not_found(msg).into_response(),
    }
}

async fn start_bot(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!(bot_id = %id, "start requested via API");
    match engine.set_bot_status(id, BotStatus::Running).await {
        Ok(bot) => Json(BotView::from_bot(bot)).into_response(),
        Err(msg) => bad_request(msg).into_response(),
    }
}

async fn stop_bot(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!(bot_id = %id, "stop requested via API");
    match engine.set_bot_status(id, BotStatus::Stopped).await {
        Ok(bot) => Json(BotView::from_bot(bot)).into_response(),
        Err(msg) => bad_request(msg).into_response(),
    }
}

async fn emergency_stop(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!(bot_id = %id, "emergency stop requested via API");
    match engine.emergency_stop(id).await {
        Ok(bot) => Json(BotView::from_bot(bot)).into_response(),
        Err(msg) => bad_request(msg).into_response(),
    }
}

// =============================================================================
// History
// =============================================================================

async fn bot_decisions(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match engine.store.decisions_for_bot(id, query.limit.min(500)).await {
        Ok(decisions) => Json(decisions).into_response(),
        Err(err) => bad_request(format!("history unavailable: {err}")).into_response(),
    }
}

async fn bot_trades(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match engine.store.trades_for_bot(id, query.limit.min(500)).await {
        Ok(trades) => Json(trades).into_response(),
        Err(err) => bad_request(format!("history unavailable: {err}")).into_response(),
    }
}

async fn recent_decisions(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.recent_decisions())
}

async fn recent_errors(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.recent_errors())
}
