use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::Json;
use turnstile_rate_limit::{Decision, RequestDescriptor};

use crate::state::SharedState;

/// POST /api/check
///
/// Decides for a request described in the JSON body, for front ends that
/// run Turnstile as a sidecar. Answers 200 when admitted and 429 when not,
/// with the standard rate-limit headers either way.
///
/// A bypass token missing from the body is taken from the configured bypass
/// header of the check call itself.
pub async fn check(
    State(state): State<SharedState>,
    request_headers: HeaderMap,
    Json(mut request): Json<RequestDescriptor>,
) -> (StatusCode, HeaderMap, Json<Decision>) {
    if request.bypass_token.is_none() {
        request.bypass_token = request_headers
            .get(state.engine.bypass_header())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let timer = state.metrics.check_duration.start_timer();
    let decision = state.engine.decide(&request).await;
    timer.observe_duration();

    let mut headers = HeaderMap::new();
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }

    let status =
        StatusCode::from_u16(decision.status_code()).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    (status, headers, Json(decision))
}
