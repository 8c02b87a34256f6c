//! Circuit breaker around the shared counter store.
//!
//! While the breaker is closed every store call goes to the shared store
//! under a bounded timeout. Consecutive failures open it; while open, calls
//! are served by a process-local [`MemoryStore`] with identical semantics.
//! After the cooldown exactly one call probes the shared store again.
//! Breaker state belongs to one engine instance and is never shared.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::{
    BucketOutcome, CounterRecord, CounterStore, KeyStats, MemoryStore, StoreError, StoreKey,
};
use crate::telemetry::{TelemetryEvent, TelemetrySink, TracingSink};
use crate::token_bucket::BucketParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Where one store call should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    /// The single half-open trial call.
    Probe,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    last_failure_ms: AtomicU64,
    probe_started_ms: AtomicU64,
    threshold: u32,
    cooldown_ms: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            probe_started_ms: AtomicU64::new(0),
            threshold: threshold.max(1),
            cooldown_ms: cooldown.as_millis() as u64,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            failures: self.failures.load(Ordering::Acquire),
            last_failure_ms: self.last_failure_ms.load(Ordering::Acquire),
        }
    }

    /// Decide where the next call goes.
    ///
    /// Once the cooldown has elapsed the first caller wins the
    /// Open -> HalfOpen transition and becomes the probe; everyone else uses
    /// the fallback until the probe reports back. A probe that never reports
    /// is re-granted after another cooldown.
    pub fn route(&self, now_ms: u64) -> (Route, Option<Transition>) {
        match self.state() {
            CircuitState::Closed => (Route::Primary, None),
            CircuitState::Open => {
                let since_failure = now_ms.saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if since_failure < self.cooldown_ms {
                    return (Route::Fallback, None);
                }
                let won = self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if !won {
                    return (Route::Fallback, None);
                }
                self.probe_started_ms.store(now_ms, Ordering::Release);
                let transition = Transition {
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                    failures: self.failures.load(Ordering::Acquire),
                };
                (Route::Probe, Some(transition))
            }
            CircuitState::HalfOpen => {
                let started = self.probe_started_ms.load(Ordering::Acquire);
                if now_ms.saturating_sub(started) < self.cooldown_ms {
                    return (Route::Fallback, None);
                }
                let regranted = self
                    .probe_started_ms
                    .compare_exchange(started, now_ms, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if regranted {
                    debug!("previous half-open probe never reported, granting a new one");
                    (Route::Probe, None)
                } else {
                    (Route::Fallback, None)
                }
            }
        }
    }

    pub fn record_success(&self, route: Route) -> Option<Transition> {
        match route {
            Route::Probe => {
                self.failures.store(0, Ordering::Release);
                let closed = self
                    .state
                    .compare_exchange(
                        CircuitState::HalfOpen as u8,
                        CircuitState::Closed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                closed.then_some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                    failures: 0,
                })
            }
            Route::Primary => {
                self.failures.store(0, Ordering::Release);
                None
            }
            Route::Fallback => None,
        }
    }

    pub fn record_failure(&self, route: Route, now_ms: u64) -> Option<Transition> {
        match route {
            Route::Probe => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.last_failure_ms.store(now_ms, Ordering::Release);
                let reopened = self
                    .state
                    .compare_exchange(
                        CircuitState::HalfOpen as u8,
                        CircuitState::Open as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                reopened.then_some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                    failures,
                })
            }
            Route::Primary => {
                // A call that was in flight when another one opened the
                // breaker must not push the cooldown out.
                if self.state() != CircuitState::Closed {
                    return None;
                }
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.last_failure_ms.store(now_ms, Ordering::Release);
                if failures < self.threshold {
                    return None;
                }
                let opened = self
                    .state
                    .compare_exchange(
                        CircuitState::Closed as u8,
                        CircuitState::Open as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                opened.then_some(Transition {
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                    failures,
                })
            }
            Route::Fallback => None,
        }
    }
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// The counter store as the engine sees it: shared store behind the breaker
/// and a timeout, local fallback otherwise. Request-path methods are
/// infallible; `reset_identity` and `stats` report shared-store failures.
pub struct GuardedStore {
    primary: Option<Arc<dyn CounterStore>>,
    fallback: Arc<MemoryStore>,
    breaker: CircuitBreaker,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl GuardedStore {
    pub fn new(
        primary: Arc<dyn CounterStore>,
        fallback: Arc<MemoryStore>,
        breaker: CircuitBreaker,
        timeout: Duration,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            primary: Some(primary),
            fallback,
            breaker,
            timeout,
            clock,
            sink,
        }
    }

    /// No shared store: every call is served locally and the breaker stays
    /// closed.
    pub fn local_only(memory: Arc<MemoryStore>) -> Self {
        Self {
            primary: None,
            fallback: memory,
            breaker: CircuitBreaker::new(1, Duration::ZERO),
            timeout: Duration::ZERO,
            clock: Arc::new(SystemClock::new()),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn fallback(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    pub fn backend(&self) -> &'static str {
        self.primary.as_deref().map_or("memory", |p| p.backend())
    }

    fn report(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            self.sink.emit(&TelemetryEvent::BreakerTransition {
                from: t.from,
                to: t.to,
                failures: t.failures,
            });
        }
    }

    async fn guarded<'a, T>(
        &'a self,
        op: &'static str,
        call: impl FnOnce(&'a dyn CounterStore) -> StoreFuture<'a, T>,
        fallback: impl FnOnce(&MemoryStore) -> T,
    ) -> T {
        let Some(primary) = self.primary.as_deref() else {
            return fallback(&self.fallback);
        };

        let (route, transition) = self.breaker.route(self.clock.now_ms());
        self.report(transition);
        if route == Route::Fallback {
            return fallback(&self.fallback);
        }

        let error = match tokio::time::timeout(self.timeout, call(primary)).await {
            Ok(Ok(value)) => {
                self.report(self.breaker.record_success(route));
                return value;
            }
            Ok(Err(e)) => e,
            Err(_) => StoreError::Timeout(self.timeout),
        };

        warn!(
            op,
            backend = primary.backend(),
            probe = route == Route::Probe,
            error = %error,
            "shared store call failed, serving from local store"
        );
        self.report(self.breaker.record_failure(route, self.clock.now_ms()));
        fallback(&self.fallback)
    }

    pub async fn increment(&self, key: &StoreKey, window: Duration, now_ms: u64) -> CounterRecord {
        self.guarded(
            "increment",
            |s| s.increment(key, window, now_ms),
            |m| m.increment_local(key, window, now_ms),
        )
        .await
    }

    pub async fn take_token(&self, key: &StoreKey, params: &BucketParams, now_ms: u64) -> BucketOutcome {
        self.guarded(
            "take_token",
            |s| s.take_token(key, params, now_ms),
            |m| m.take_token_local(key, params, now_ms),
        )
        .await
    }

    pub async fn penalty_level(&self, key: &StoreKey, now_ms: u64) -> u32 {
        self.guarded(
            "penalty_level",
            |s| s.penalty_level(key, now_ms),
            |m| m.penalty_level_local(key, now_ms),
        )
        .await
    }

    pub async fn record_violation(
        &self,
        key: &StoreKey,
        max_level: u32,
        decay: Duration,
        now_ms: u64,
    ) -> u32 {
        self.guarded(
            "record_violation",
            |s| s.record_violation(key, max_level, decay, now_ms),
            |m| m.record_violation_local(key, max_level, decay, now_ms),
        )
        .await
    }

    pub async fn flag_suspicious(&self, key: &StoreKey, ttl: Duration, now_ms: u64) -> bool {
        self.guarded(
            "flag_suspicious",
            |s| s.flag_suspicious(key, ttl, now_ms),
            |m| m.flag_suspicious_local(key, ttl, now_ms),
        )
        .await
    }

    /// Operator calls skip the breaker and go straight to the shared store
    /// under the timeout. Failures are returned, not absorbed. `None` when
    /// there is no shared store.
    async fn direct<'a, T>(
        &'a self,
        op: &'static str,
        call: impl FnOnce(&'a dyn CounterStore) -> StoreFuture<'a, T>,
    ) -> Result<Option<T>, StoreError> {
        let Some(primary) = self.primary.as_deref() else {
            return Ok(None);
        };
        let result = match tokio::time::timeout(self.timeout, call(primary)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        if let Err(e) = &result {
            warn!(op, backend = primary.backend(), error = %e, "shared store call failed");
        }
        result.map(Some)
    }

    /// Clear an identity from the local store and the shared store. The
    /// local records are cleared even when the shared store fails.
    pub async fn reset_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let local = self.fallback.reset_identity_local(identity);
        let shared = self
            .direct("reset_identity", |s| s.reset_identity(identity))
            .await?;
        Ok(shared.unwrap_or(0) + local)
    }

    pub async fn stats(&self, identity: &str, now_ms: u64) -> Result<KeyStats, StoreError> {
        let mut stats = self
            .direct("stats", |s| s.stats(identity, now_ms))
            .await?
            .unwrap_or_default();
        stats.merge(self.fallback.stats_local(identity, now_ms));
        Ok(stats)
    }
}
