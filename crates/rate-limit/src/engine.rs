//! The admission engine: one explicitly constructed instance per process,
//! shared behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::info;
use turnstile_common::{AppConfig, TurnstileError, TurnstileResult};
use turnstile_trusted_net::TrustedNetworks;

use crate::admission::{ceil_secs, Admission};
use crate::bypass::BypassPolicy;
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, GuardedStore};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, RejectReason};
use crate::descriptor::RequestDescriptor;
use crate::fixed_window::FixedWindow;
use crate::identity::{anonymize_remote, CredentialHasher, KeyComposer};
use crate::load::{LoadAdjuster, LoadSampleError, LoadSignal};
use crate::penalty::{self, PenaltyTracker};
use crate::policy::{Algorithm, PolicyRouter, ProfileSummary};
use crate::store::{CounterStore, KeyStats, MemoryStore, RecordKind, StoreError, StoreKey};
use crate::telemetry::{TelemetryEvent, TelemetrySink, TracingSink};
use crate::token_bucket::TokenBucket;

fn strategy(algorithm: Algorithm) -> &'static dyn Admission {
    match algorithm {
        Algorithm::Counter => &FixedWindow,
        Algorithm::TokenBucket => &TokenBucket,
    }
}

fn reject_reason(algorithm: Algorithm) -> RejectReason {
    match algorithm {
        Algorithm::Counter => RejectReason::QuotaExhausted,
        Algorithm::TokenBucket => RejectReason::BucketEmpty,
    }
}

/// Assembles an [`AdmissionEngine`] from configuration plus the runtime
/// pieces configuration cannot describe.
pub struct EngineBuilder {
    config: AppConfig,
    store: Option<Arc<dyn CounterStore>>,
    fallback: Option<Arc<MemoryStore>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn TelemetrySink>>,
    networks: Option<Arc<TrustedNetworks>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            fallback: None,
            clock: None,
            sink: None,
            networks: None,
        }
    }

    /// Shared store guarded by the circuit breaker. Without one the engine
    /// runs on its local store alone.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fallback(mut self, fallback: Arc<MemoryStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use an existing trusted network set instead of loading one from the
    /// bypass configuration, so that the caller can reload it later.
    pub fn trusted_networks(mut self, networks: Arc<TrustedNetworks>) -> Self {
        self.networks = Some(networks);
        self
    }

    pub fn build(self) -> TurnstileResult<AdmissionEngine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        let router = PolicyRouter::from_config(&config.default_profile, &config.profiles)?;
        let hasher = CredentialHasher::new(&config.identity.credential_salt)
            .map_err(|e| TurnstileError::Config(format!("credential salt: {}", e)))?;

        let networks = match self.networks {
            Some(networks) => networks,
            None => {
                let networks = TrustedNetworks::new();
                networks
                    .reload(
                        &config.bypass.trusted_networks,
                        config.bypass.trusted_networks_file.as_deref(),
                    )
                    .map_err(|e| TurnstileError::Config(e.to_string()))?;
                Arc::new(networks)
            }
        };
        let bypass = BypassPolicy::new(
            config.bypass.secret.as_deref(),
            networks,
            &config.bypass.trusted_agents,
        );

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let fallback = self.fallback.unwrap_or_default();

        let store = match self.store {
            Some(primary) => GuardedStore::new(
                primary,
                fallback,
                CircuitBreaker::new(
                    config.circuit_breaker.failure_threshold,
                    Duration::from_secs(config.circuit_breaker.cooldown_secs),
                ),
                Duration::from_millis(config.store.timeout_ms),
                Arc::clone(&clock),
                Arc::clone(&sink),
            ),
            None => GuardedStore::local_only(fallback),
        };

        info!(
            profiles = config.profiles.len() + 1,
            backend = store.backend(),
            "admission engine ready"
        );

        Ok(AdmissionEngine {
            router,
            composer: KeyComposer::new(hasher),
            bypass,
            store,
            penalties: PenaltyTracker::from_config(&config.penalty),
            load: LoadAdjuster::from_config(&config.load),
            signal: LoadSignal::from_config(&config.load),
            clock,
            sink,
            retry_jitter_secs: config.retry_jitter_secs,
            suspicious_fraction: config.suspicious_fraction,
            bypass_header: config.bypass.header.trim().to_ascii_lowercase(),
        })
    }
}

pub struct AdmissionEngine {
    router: PolicyRouter,
    composer: KeyComposer,
    bypass: BypassPolicy,
    store: GuardedStore,
    penalties: PenaltyTracker,
    load: LoadAdjuster,
    signal: LoadSignal,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    retry_jitter_secs: u64,
    suspicious_fraction: f64,
    bypass_header: String,
}

impl AdmissionEngine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Decide whether `request` may proceed.
    ///
    /// Never fails: shared-store trouble is absorbed by the breaker and a
    /// malformed address degrades to the `invalid` key.
    pub async fn decide(&self, request: &RequestDescriptor) -> Decision {
        let now_ms = self.clock.now_ms();
        let classification = self.router.classify(request);
        let profile = classification.profile;

        if profile.allow_bypass {
            if let Some(kind) = self.bypass.check(request) {
                self.sink.emit(&TelemetryEvent::Bypassed {
                    profile: profile.name.clone(),
                    kind,
                    addr: anonymize_remote(request),
                });
                return Decision::bypassed(&profile.name, kind);
            }
        }

        let identity = self
            .composer
            .compose(request, profile, classification.route)
            .to_string();

        let mut limit = profile.max_requests;
        if profile.dynamic_load {
            limit = self.load.adjusted_limit(limit, self.signal.current(now_ms));
        }

        let penalty_key = StoreKey::new(RecordKind::Penalty, &profile.name, &identity);
        let mut level = 0;
        if profile.progressive_penalty {
            level = self.penalties.level(&self.store, &penalty_key, now_ms).await;
            limit = penalty::apply(limit, level);
        }

        let weight = u64::from(profile.weight.weight_for(request));
        let limit = (limit / weight).max(1);

        let outcome = strategy(profile.algorithm)
            .admit(&self.store, profile, &identity, limit, now_ms)
            .await;

        if outcome.utilisation() > self.suspicious_fraction {
            let flag_key = StoreKey::new(RecordKind::Suspicious, &profile.name, &identity);
            if self.store.flag_suspicious(&flag_key, profile.window, now_ms).await {
                self.sink.emit(&TelemetryEvent::SuspectedAbuse {
                    profile: profile.name.clone(),
                    key: identity.clone(),
                    current: outcome.current,
                    limit,
                });
            }
        }

        let reset_after_secs = ceil_secs(outcome.reset_after.as_millis() as u64).as_secs();

        if outcome.admitted {
            self.sink.emit(&TelemetryEvent::Admitted {
                profile: profile.name.clone(),
            });
            return Decision {
                admitted: true,
                profile: profile.name.clone(),
                limit,
                current: outcome.current,
                remaining: outcome.remaining,
                reset_after_secs,
                retry_after_secs: None,
                reason: None,
                bypass: None,
            };
        }

        let reason = reject_reason(profile.algorithm);
        let mut penalty_level = level;
        if profile.progressive_penalty {
            penalty_level = self
                .penalties
                .record_violation(&self.store, &penalty_key, now_ms)
                .await;
            if penalty_level > level {
                self.sink.emit(&TelemetryEvent::PenaltyEscalated {
                    profile: profile.name.clone(),
                    key: identity.clone(),
                    level: penalty_level,
                });
            }
        }

        let base_retry = outcome
            .retry_after
            .unwrap_or(Duration::from_secs(1))
            .as_secs()
            .max(1);
        let retry_after_secs = base_retry + self.jitter();

        self.sink.emit(&TelemetryEvent::Rejected {
            profile: profile.name.clone(),
            key: identity,
            limit,
            current: outcome.current,
            retry_after_secs,
            reason,
            penalty_level,
        });

        Decision {
            admitted: false,
            profile: profile.name.clone(),
            limit,
            current: outcome.current,
            remaining: 0,
            reset_after_secs,
            retry_after_secs: Some(retry_after_secs),
            reason: Some(reason),
            bypass: None,
        }
    }

    fn jitter(&self) -> u64 {
        if self.retry_jitter_secs == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=self.retry_jitter_secs)
    }

    /// Delete everything stored for a composite key, across profiles.
    /// Returns the number of records cleared.
    ///
    /// The shared store is asked directly whatever the breaker state, so an
    /// unreachable store is an error rather than a silent partial reset.
    pub async fn reset_key(&self, identity: &str) -> Result<usize, StoreError> {
        let cleared = self.store.reset_identity(identity).await?;
        info!(key = identity, cleared, "rate limit key reset");
        Ok(cleared)
    }

    pub async fn stats(&self, identity: &str) -> Result<KeyStats, StoreError> {
        self.store.stats(identity, self.clock.now_ms()).await
    }

    pub fn set_load(&self, load: f64) -> Result<(), LoadSampleError> {
        self.signal.set(load, self.clock.now_ms())
    }

    pub fn clear_load(&self) {
        self.signal.clear();
    }

    pub fn current_load(&self) -> Option<f64> {
        self.signal.current(self.clock.now_ms())
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.store.breaker().snapshot()
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn profiles(&self) -> Vec<ProfileSummary> {
        self.router.profiles().map(ProfileSummary::from).collect()
    }

    /// Lowercase name of the request header that carries the bypass secret.
    /// Front ends copy its value into [`RequestDescriptor::bypass_token`].
    pub fn bypass_header(&self) -> &str {
        &self.bypass_header
    }

    pub fn trusted_networks(&self) -> &Arc<TrustedNetworks> {
        self.bypass.networks()
    }

    /// Drop expired records from the local store.
    pub fn purge_local(&self) -> usize {
        self.store.fallback().purge_expired(self.clock.now_ms())
    }
}
