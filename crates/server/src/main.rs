mod loadavg;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use turnstile_admin::EngineMetrics;
use turnstile_common::{AppConfig, StoreConfig, StoreKind};
use turnstile_rate_limit::{AdmissionEngine, CounterStore, FanoutSink, TelemetrySink, TracingSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/turnstile.yaml".to_string());

    info!(config_path = %config_path, "starting Turnstile");

    let config = AppConfig::load(&config_path)?;

    let metrics = Arc::new(EngineMetrics::new()?);
    let sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(TracingSink), metrics.clone()];

    let mut builder = AdmissionEngine::builder(config.clone()).sink(Arc::new(FanoutSink::new(sinks)));
    if let Some(store) = connect_store(&config.store).await? {
        builder = builder.store(store);
    }
    let engine = Arc::new(builder.build()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    if config.store.purge_interval_secs > 0 {
        background.push(tasks::spawn_purge(
            engine.clone(),
            Duration::from_secs(config.store.purge_interval_secs),
            shutdown_rx.clone(),
        ));
    }
    if config.load.poll_loadavg {
        info!(interval_secs = config.load.poll_interval_secs, "sampling host load average");
        background.push(tasks::spawn_load_poller(
            engine.clone(),
            Duration::from_secs(config.load.poll_interval_secs.max(1)),
            shutdown_rx.clone(),
        ));
    }
    #[cfg(unix)]
    background.push(tasks::spawn_network_reload(
        engine.clone(),
        config.bypass.clone(),
        shutdown_rx.clone(),
    )?);

    let state = turnstile_admin::new_shared_state(engine, metrics);
    let result = turnstile_admin::run_admin_server(
        state,
        &config.server.admin.listen,
        shutdown_signal(),
    )
    .await;

    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }

    info!("Turnstile stopped");
    result
}

/// Open the configured shared store. `None` keeps counters in process.
async fn connect_store(config: &StoreConfig) -> Result<Option<Arc<dyn CounterStore>>> {
    match config.kind {
        StoreKind::Memory => Ok(None),
        StoreKind::Redis => connect_redis(config).await.map(Some),
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    use anyhow::Context;

    let url = config
        .url
        .as_deref()
        .context("store.url is required when store.kind is redis")?;
    let store = turnstile_rate_limit::RedisStore::connect(url, &config.key_prefix)
        .await
        .context("failed to connect to redis counter store")?;
    info!(prefix = %config.key_prefix, timeout_ms = config.timeout_ms, "using redis counter store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    anyhow::bail!("store.kind is redis but turnstile was built without the `redis` feature")
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
