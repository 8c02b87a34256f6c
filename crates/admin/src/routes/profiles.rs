use axum::extract::State;
use axum::Json;
use turnstile_rate_limit::ProfileSummary;

use crate::state::SharedState;

/// GET /api/profiles
///
/// Lists every configured profile, the default profile first.
pub async fn list_profiles(State(state): State<SharedState>) -> Json<Vec<ProfileSummary>> {
    Json(state.engine.profiles())
}
