// =============================================================================
// Status API — minimal read-only health/status surface
// =============================================================================
//
// No dashboard, no mutation endpoints: this is an observability surface for
// an external monitor (load balancer health check, ops dashboard) to poll.
// Control actions (pause/resume/kill-reset) go through the CLI, not HTTP.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;

pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(cors)
        .with_state(app)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    trading_mode: String,
    can_trade: bool,
    open_positions: Vec<crate::position_state::Position>,
    risk_state: crate::risk::RiskState,
}

async fn status(State(app): State<Arc<App>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        trading_mode: app.config.read().trading.mode.to_string(),
        can_trade: app.kill_switch.can_trade(),
        open_positions: app.positions.get_all(),
        risk_state: app.risk_engine.get_state(),
    })
}
