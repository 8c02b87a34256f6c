use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use turnstile_rate_limit::CircuitState;

use crate::state::SharedState;

/// GET /api/health
///
/// Reports uptime, version, the counter store backend and whether the engine
/// is currently running on its local fallback.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let breaker = state.engine.breaker();
    let status = if breaker.state == CircuitState::Closed {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.engine.backend(),
        "breaker": breaker.state,
    }))
}
