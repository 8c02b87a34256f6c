use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use turnstile_common::{AlgorithmKind, AppConfig, ProfileConfig};
use turnstile_rate_limit::store::{BucketOutcome, CounterRecord, StoreKey};
use turnstile_rate_limit::token_bucket::BucketParams;
use turnstile_rate_limit::{
    AdmissionEngine, BypassKind, CircuitState, Clock, CounterStore, KeyStats, ManualClock,
    MemorySink, MemoryStore, RejectReason, RequestDescriptor, StoreError, TelemetryEvent,
};

/// Counter store whose health is scripted by the test.
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn increment(
        &self,
        key: &StoreKey,
        window: Duration,
        now_ms: u64,
    ) -> Result<CounterRecord, StoreError> {
        self.enter().await?;
        self.inner.increment(key, window, now_ms).await
    }

    async fn take_token(
        &self,
        key: &StoreKey,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        self.enter().await?;
        self.inner.take_token(key, params, now_ms).await
    }

    async fn penalty_level(&self, key: &StoreKey, now_ms: u64) -> Result<u32, StoreError> {
        self.enter().await?;
        self.inner.penalty_level(key, now_ms).await
    }

    async fn record_violation(
        &self,
        key: &StoreKey,
        max_level: u32,
        decay: Duration,
        now_ms: u64,
    ) -> Result<u32, StoreError> {
        self.enter().await?;
        self.inner.record_violation(key, max_level, decay, now_ms).await
    }

    async fn flag_suspicious(
        &self,
        key: &StoreKey,
        ttl: Duration,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        self.inner.flag_suspicious(key, ttl, now_ms).await
    }

    async fn reset_identity(&self, identity: &str) -> Result<usize, StoreError> {
        self.enter().await?;
        self.inner.reset_identity(identity).await
    }

    async fn stats(&self, identity: &str, now_ms: u64) -> Result<KeyStats, StoreError> {
        self.enter().await?;
        self.inner.stats(identity, now_ms).await
    }
}

fn profile(name: &str, route: &str, max_requests: u64) -> ProfileConfig {
    ProfileConfig {
        name: name.to_string(),
        routes: vec![route.to_string()],
        window_secs: 60,
        max_requests,
        ..ProfileConfig::default()
    }
}

struct Harness {
    engine: Arc<AdmissionEngine>,
    clock: Arc<ManualClock>,
    sink: Arc<MemorySink>,
}

fn harness(config: AppConfig) -> Harness {
    harness_with_store(config, None)
}

fn harness_with_store(config: AppConfig, store: Option<Arc<FlakyStore>>) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let sink = Arc::new(MemorySink::new());
    let mut builder = AdmissionEngine::builder(config)
        .clock(clock.clone())
        .sink(sink.clone());
    if let Some(store) = store {
        builder = builder.store(store);
    }
    Harness {
        engine: Arc::new(builder.build().unwrap()),
        clock,
        sink,
    }
}

fn config(profiles: Vec<ProfileConfig>) -> AppConfig {
    AppConfig {
        profiles,
        ..AppConfig::default()
    }
}

fn login(addr: &str) -> RequestDescriptor {
    RequestDescriptor::new("POST", "/api/auth/login", addr)
}

#[tokio::test]
async fn counter_admits_five_then_rejects_until_window_expires() {
    let h = harness(config(vec![profile("login", "/api/auth/login", 5)]));
    let req = login("198.51.100.7:40000");

    for i in 0..5 {
        let d = h.engine.decide(&req).await;
        assert!(d.admitted, "request {} should be admitted", i + 1);
        assert_eq!(d.profile, "login");
    }

    let rejected = h.engine.decide(&req).await;
    assert!(!rejected.admitted);
    assert_eq!(rejected.reason, Some(RejectReason::QuotaExhausted));
    let retry = rejected.retry_after_secs.unwrap();
    assert!((60..=65).contains(&retry), "retry-after {} out of range", retry);
    assert_eq!(rejected.status_code(), 429);

    h.clock.advance(Duration::from_secs(61));
    let again = h.engine.decide(&req).await;
    assert!(again.admitted);
    assert_eq!(again.current, 1);
}

#[tokio::test]
async fn token_bucket_bursts_seven_and_refills_one_per_twelve_seconds() {
    let mut bucket = profile("search", "/api/search", 5);
    bucket.algorithm = AlgorithmKind::TokenBucket;
    let h = harness(config(vec![bucket]));
    let req = RequestDescriptor::new("GET", "/api/search?q=lamp", "198.51.100.7");

    for i in 0..7 {
        assert!(h.engine.decide(&req).await.admitted, "burst request {}", i + 1);
    }
    let rejected = h.engine.decide(&req).await;
    assert!(!rejected.admitted);
    assert_eq!(rejected.reason, Some(RejectReason::BucketEmpty));
    assert!((6..=11).contains(&rejected.retry_after_secs.unwrap()));

    h.clock.advance(Duration::from_secs(12));
    assert!(h.engine.decide(&req).await.admitted);
    assert!(!h.engine.decide(&req).await.admitted);
}

#[tokio::test]
async fn penalties_divide_quota_and_decay() {
    let mut api = profile("api", "/api/*", 100);
    api.progressive_penalty = true;
    let h = harness(config(vec![api]));
    let req = RequestDescriptor::new("GET", "/api/products", "203.0.113.50");

    for _ in 0..100 {
        assert!(h.engine.decide(&req).await.admitted);
    }
    for _ in 0..3 {
        assert!(!h.engine.decide(&req).await.admitted);
    }

    h.clock.advance(Duration::from_secs(61));
    let penalised = h.engine.decide(&req).await;
    assert!(penalised.admitted);
    assert_eq!(penalised.limit, 12);

    let stats = h.engine.stats("ip=203.0.x.x").await.unwrap();
    assert_eq!(stats.penalties.len(), 1);
    assert_eq!(stats.penalties[0].level, 3);
    assert_eq!(stats.penalties[0].multiplier, 8);

    h.clock.advance(Duration::from_secs(3600));
    let recovered = h.engine.decide(&req).await;
    assert_eq!(recovered.limit, 100);

    let escalations = h
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, TelemetryEvent::PenaltyEscalated { .. }))
        .count();
    assert_eq!(escalations, 3);
}

#[tokio::test]
async fn penalty_level_is_not_exposed_to_callers() {
    let mut api = profile("api", "/api/*", 1);
    api.progressive_penalty = true;
    let h = harness(config(vec![api]));
    let req = RequestDescriptor::new("GET", "/api/x", "203.0.113.50");

    h.engine.decide(&req).await;
    let rejected = h.engine.decide(&req).await;
    let json = serde_json::to_string(&rejected).unwrap();
    assert!(!json.contains("penalty"));
    assert!(rejected.headers().iter().all(|(name, _)| !name.contains("Penalty")));
}

#[tokio::test]
async fn breaker_opens_after_five_failures_and_recovers_through_probe() {
    let store = Arc::new(FlakyStore::new());
    let mut cfg = config(vec![profile("api", "/api/*", 1000)]);
    cfg.circuit_breaker.failure_threshold = 5;
    cfg.circuit_breaker.cooldown_secs = 30;
    let h = harness_with_store(cfg, Some(store.clone()));
    let req = RequestDescriptor::new("GET", "/api/products", "192.0.2.10");

    store.fail(true);
    for _ in 0..5 {
        assert!(h.engine.decide(&req).await.admitted, "fallback still admits");
    }
    assert_eq!(h.engine.breaker().state, CircuitState::Open);
    assert_eq!(store.calls(), 5);

    // Open: the shared store is not touched during the cooldown.
    h.clock.advance(Duration::from_secs(10));
    h.engine.decide(&req).await;
    assert_eq!(store.calls(), 5);

    h.clock.advance(Duration::from_secs(20));
    store.fail(false);
    assert!(h.engine.decide(&req).await.admitted);
    assert_eq!(store.calls(), 6);
    assert_eq!(h.engine.breaker().state, CircuitState::Closed);
    assert_eq!(h.engine.breaker().failures, 0);

    let transitions: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TelemetryEvent::BreakerTransition { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn failed_probe_reopens_and_restarts_cooldown() {
    let store = Arc::new(FlakyStore::new());
    let h = harness_with_store(
        config(vec![profile("api", "/api/*", 1000)]),
        Some(store.clone()),
    );
    let req = RequestDescriptor::new("GET", "/api/products", "192.0.2.10");

    store.fail(true);
    for _ in 0..5 {
        h.engine.decide(&req).await;
    }
    h.clock.advance(Duration::from_secs(30));
    h.engine.decide(&req).await;
    assert_eq!(store.calls(), 6);
    assert_eq!(h.engine.breaker().state, CircuitState::Open);

    h.clock.advance(Duration::from_secs(29));
    h.engine.decide(&req).await;
    assert_eq!(store.calls(), 6);

    h.clock.advance(Duration::from_secs(1));
    store.fail(false);
    h.engine.decide(&req).await;
    assert_eq!(store.calls(), 7);
    assert_eq!(h.engine.breaker().state, CircuitState::Closed);
}

#[tokio::test]
async fn slow_store_counts_as_failure() {
    let store = Arc::new(FlakyStore::new());
    store.delay_ms.store(500, Ordering::SeqCst);
    let mut cfg = config(vec![profile("api", "/api/*", 1000)]);
    cfg.store.timeout_ms = 20;
    let h = harness_with_store(cfg, Some(store.clone()));

    let d = h
        .engine
        .decide(&RequestDescriptor::new("GET", "/api/x", "192.0.2.10"))
        .await;
    assert!(d.admitted);
    assert_eq!(h.engine.breaker().failures, 1);
}

#[tokio::test]
async fn load_at_threshold_gives_min_fraction() {
    let mut api = profile("api", "/api/*", 100);
    api.dynamic_load = true;
    let h = harness(config(vec![api]));
    let req = RequestDescriptor::new("GET", "/api/x", "192.0.2.10");

    assert_eq!(h.engine.decide(&req).await.limit, 100);

    h.engine.set_load(0.7).unwrap();
    assert_eq!(h.engine.decide(&req).await.limit, 30);

    h.engine.set_load(0.0).unwrap();
    assert_eq!(h.engine.decide(&req).await.limit, 100);

    h.engine.set_load(0.9).unwrap();
    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.engine.decide(&req).await.limit, 100, "stale sample ignored");
}

#[tokio::test]
async fn bypassed_requests_are_admitted_and_leave_no_state() {
    let mut cfg = config(vec![profile("login", "/api/auth/login", 1)]);
    cfg.bypass.trusted_networks = vec!["10.0.0.0/8".into()];
    cfg.bypass.secret = Some("let-me-in".into());
    cfg.bypass.trusted_agents = vec!["HealthChecker".into()];
    let h = harness(cfg);

    for _ in 0..20 {
        let d = h.engine.decide(&login("10.1.1.1:5000")).await;
        assert!(d.admitted);
        assert_eq!(d.bypass, Some(BypassKind::TrustedNetwork));
    }
    let by_secret = login("198.51.100.1").with_bypass_token("let-me-in");
    assert_eq!(h.engine.decide(&by_secret).await.bypass, Some(BypassKind::Secret));
    let by_agent = login("198.51.100.1").with_user_agent("healthchecker/1.0");
    assert_eq!(h.engine.decide(&by_agent).await.bypass, Some(BypassKind::TrustedAgent));

    assert!(h.engine.stats("ip=10.1.x.x").await.unwrap().is_empty());
    assert!(h.engine.stats("ip=198.51.x.x").await.unwrap().is_empty());
    assert_eq!(h.sink.count("bypassed"), 22);
    assert!(h.engine.decide(&login("198.51.100.1")).await.admitted);
}

#[tokio::test]
async fn profile_can_refuse_bypass() {
    let mut strict = profile("login", "/api/auth/login", 1);
    strict.allow_bypass = false;
    let mut cfg = config(vec![strict]);
    cfg.bypass.trusted_networks = vec!["10.0.0.0/8".into()];
    let h = harness(cfg);

    assert!(h.engine.decide(&login("10.1.1.1")).await.admitted);
    let second = h.engine.decide(&login("10.1.1.1")).await;
    assert!(!second.admitted);
    assert_eq!(second.bypass, None);
}

#[tokio::test]
async fn reset_key_clears_counters_and_penalties() {
    let mut api = profile("api", "/api/*", 2);
    api.progressive_penalty = true;
    let h = harness(config(vec![api]));
    let req = RequestDescriptor::new("GET", "/api/x", "192.0.2.99");

    for _ in 0..3 {
        h.engine.decide(&req).await;
    }
    let stats = h.engine.stats("ip=192.0.x.x").await.unwrap();
    assert_eq!(stats.limits[0].count, Some(3));
    assert_eq!(stats.penalties[0].level, 1);

    assert!(h.engine.reset_key("ip=192.0.x.x").await.unwrap() >= 2);
    assert!(h.engine.stats("ip=192.0.x.x").await.unwrap().is_empty());
    let fresh = h.engine.decide(&req).await;
    assert!(fresh.admitted);
    assert_eq!(fresh.current, 1);
}

#[tokio::test]
async fn reset_key_reaches_shared_store_while_breaker_is_open() {
    let store = Arc::new(FlakyStore::new());
    let mut api = profile("api", "/api/*", 2);
    api.progressive_penalty = true;
    let h = harness_with_store(config(vec![api]), Some(store.clone()));
    let req = RequestDescriptor::new("GET", "/api/x", "192.0.2.99");
    let identity = "ip=192.0.x.x";

    for _ in 0..3 {
        h.engine.decide(&req).await;
    }
    let shared = store.inner.stats(identity, h.clock.now_ms()).await.unwrap();
    assert_eq!(shared.limits[0].count, Some(3));
    assert_eq!(shared.penalties[0].level, 1);

    store.fail(true);
    for _ in 0..5 {
        h.engine.decide(&req).await;
    }
    assert_eq!(h.engine.breaker().state, CircuitState::Open);

    // Still unreachable: the reset is refused instead of reporting success.
    assert!(h.engine.reset_key(identity).await.is_err());
    assert!(h.engine.stats(identity).await.is_err());

    store.fail(false);
    let cleared = h.engine.reset_key(identity).await.unwrap();
    assert!(cleared >= 3, "cleared {}", cleared);
    assert!(store
        .inner
        .stats(identity, h.clock.now_ms())
        .await
        .unwrap()
        .is_empty());
    assert!(h.engine.stats(identity).await.unwrap().is_empty());
    assert_eq!(h.engine.breaker().state, CircuitState::Open);

    h.clock.advance(Duration::from_secs(30));
    let after = h.engine.decide(&req).await;
    assert!(after.admitted);
    assert_eq!(after.limit, 2);
    assert_eq!(after.current, 1);
}

#[tokio::test]
async fn suspected_abuse_is_reported_once_per_window() {
    let h = harness(config(vec![profile("login", "/api/auth/login", 5)]));
    let req = login("198.51.100.7");

    for _ in 0..4 {
        h.engine.decide(&req).await;
    }
    assert_eq!(h.sink.count("suspected_abuse"), 0);

    h.engine.decide(&req).await;
    h.engine.decide(&req).await;
    assert_eq!(h.sink.count("suspected_abuse"), 1);
    assert_eq!(h.engine.stats("ip=198.51.x.x").await.unwrap().suspicious, vec!["login".to_string()]);
}

#[tokio::test]
async fn credentials_and_callers_get_separate_quotas() {
    let h = harness(config(vec![profile("api", "/api/*", 1)]));
    let alice = RequestDescriptor::new("GET", "/api/x", "192.0.2.1").with_bearer("alice-token");
    let bob = RequestDescriptor::new("GET", "/api/x", "192.0.2.1").with_bearer("bob-token");

    assert!(h.engine.decide(&alice).await.admitted);
    assert!(h.engine.decide(&bob).await.admitted);
    assert!(!h.engine.decide(&alice).await.admitted);
}

#[tokio::test]
async fn unparseable_address_shares_the_invalid_key() {
    let h = harness(config(vec![profile("api", "/api/*", 1)]));

    assert!(h.engine.decide(&RequestDescriptor::new("GET", "/api/x", "???")).await.admitted);
    assert!(!h.engine.decide(&RequestDescriptor::new("GET", "/api/x", "")).await.admitted);
    assert_eq!(h.engine.stats("ip=invalid").await.unwrap().limits.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_decisions_never_over_admit() {
    let h = harness(config(vec![profile("api", "/api/*", 10)]));

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move {
                engine
                    .decide(&RequestDescriptor::new("GET", "/api/x", "192.0.2.1"))
                    .await
                    .admitted
            })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn unmatched_requests_use_the_default_profile() {
    let h = harness(config(vec![profile("api", "/api/*", 1)]));
    let d = h
        .engine
        .decide(&RequestDescriptor::new("GET", "/healthz", "192.0.2.1"))
        .await;
    assert_eq!(d.profile, "default");
    assert_eq!(d.limit, 100);
}

#[test]
fn manual_clock_drives_engine_time() {
    let clock = ManualClock::new(1_000);
    clock.advance(Duration::from_millis(500));
    assert_eq!(clock.now_ms(), 1_500);
}
