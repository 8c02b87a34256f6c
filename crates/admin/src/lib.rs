pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use turnstile_rate_limit::AdmissionEngine;

pub use state::{AppState, EngineMetrics, SharedState};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::health_check))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        // Sidecar decisions
        .route("/api/check", post(routes::check::check))
        // Per-key inspection and reset
        .route("/api/keys/{key}", axum::routing::delete(routes::keys::reset_key))
        .route("/api/keys/{key}/stats", get(routes::keys::key_stats))
        .route("/api/profiles", get(routes::profiles::list_profiles))
        .route("/api/breaker", get(routes::breaker::get_breaker))
        .route(
            "/api/load",
            get(routes::load::get_load)
                .put(routes::load::set_load)
                .delete(routes::load::clear_load),
        )
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// Runs until `shutdown` resolves, then drains in-flight requests.
pub async fn run_admin_server<F>(
    state: SharedState,
    listen_addr: &str,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Convenience function to create a SharedState around a built engine.
pub fn new_shared_state(engine: Arc<AdmissionEngine>, metrics: Arc<EngineMetrics>) -> SharedState {
    Arc::new(AppState::new(engine, metrics))
}
