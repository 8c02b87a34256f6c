use axum::extract::State;
use axum::Json;
use turnstile_rate_limit::BreakerSnapshot;

use crate::state::SharedState;

/// GET /api/breaker
pub async fn get_breaker(State(state): State<SharedState>) -> Json<BreakerSnapshot> {
    Json(state.engine.breaker())
}
