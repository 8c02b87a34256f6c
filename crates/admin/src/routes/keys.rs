use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use turnstile_rate_limit::{KeyStats, StoreError};

use crate::state::SharedState;

fn store_unavailable(key: &str, error: StoreError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "key": key,
            "error": error.to_string(),
        })),
    )
}

/// GET /api/keys/{key}/stats
///
/// `key` is a composite rate-limit key such as `ip=203.0.x.x;uid=42`,
/// percent-encoded in the path.
pub async fn key_stats(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Json<KeyStats>, (StatusCode, Json<Value>)> {
    match state.engine.stats(&key).await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => Err(store_unavailable(&key, e)),
    }
}

/// DELETE /api/keys/{key}
///
/// Clears every counter, bucket, penalty and flag stored for the key. Answers
/// 503 when the shared store cannot be reached, since instances would still
/// hold the key's state.
pub async fn reset_key(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.reset_key(&key).await {
        Ok(cleared) => Ok(Json(json!({
            "key": key,
            "cleared": cleared,
        }))),
        Err(e) => Err(store_unavailable(&key, e)),
    }
}
