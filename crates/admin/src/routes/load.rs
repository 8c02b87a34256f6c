use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct LoadSample {
    pub load: f64,
}

/// GET /api/load
pub async fn get_load(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "load": state.engine.current_load() }))
}

/// PUT /api/load
///
/// Pushes a load sample (0.0 idle, 1.0 saturated) for profiles with dynamic
/// limits.
pub async fn set_load(
    State(state): State<SharedState>,
    Json(sample): Json<LoadSample>,
) -> (StatusCode, Json<Value>) {
    match state.engine.set_load(sample.load) {
        Ok(()) => {
            tracing::debug!(load = sample.load, "load sample updated via admin API");
            (StatusCode::OK, Json(json!({ "load": sample.load })))
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": e.to_string(),
            })),
        ),
    }
}

/// DELETE /api/load
pub async fn clear_load(State(state): State<SharedState>) -> StatusCode {
    state.engine.clear_load();
    StatusCode::NO_CONTENT
}
