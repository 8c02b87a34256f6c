//! Background maintenance tasks. Each runs until the shutdown channel flips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
#[cfg(unix)]
use turnstile_common::BypassConfig;
use turnstile_rate_limit::AdmissionEngine;

use crate::loadavg;

/// Periodically drop expired entries from the in-process store.
pub fn spawn_purge(
    engine: Arc<AdmissionEngine>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.purge_local();
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Feed the host load average into the engine.
pub fn spawn_load_poller(
    engine: Arc<AdmissionEngine>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        let mut failing = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match loadavg::sample().map(|load| engine.set_load(load)) {
                        Ok(Ok(())) => failing = false,
                        Ok(Err(e)) => warn!(error = %e, "discarding load sample"),
                        Err(e) => {
                            // Stale samples age out on their own; log once per outage.
                            if !failing {
                                warn!(error = %e, "failed to sample host load");
                                failing = true;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Re-read the trusted network list on SIGHUP.
#[cfg(unix)]
pub fn spawn_network_reload(
    engine: Arc<AdmissionEngine>,
    bypass: BypassConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    let networks = engine.trusted_networks();
                    match networks.reload(
                        &bypass.trusted_networks,
                        bypass.trusted_networks_file.as_deref(),
                    ) {
                        Ok(count) => tracing::debug!(count, "trusted networks reloaded on SIGHUP"),
                        Err(e) => warn!(error = %e, "trusted network reload failed, keeping previous list"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}
