//! Integration tests for the Redis counter store.
//!
//! These tests require a Redis instance at `redis://127.0.0.1/` (override
//! with `TURNSTILE_TEST_REDIS`). They are ignored by default; run with
//! `cargo test -p turnstile-rate-limit --features redis --test redis_store -- --ignored`

#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use turnstile_common::{AlgorithmKind, AppConfig, ProfileConfig};
use turnstile_rate_limit::store::{RecordKind, StoreKey};
use turnstile_rate_limit::{
    AdmissionEngine, CircuitState, Clock, CounterStore, ManualClock, RedisStore, RejectReason,
    RequestDescriptor, SystemClock,
};

fn redis_url() -> String {
    std::env::var("TURNSTILE_TEST_REDIS").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

/// Connect with a prefix unique to this test run, or `None` when Redis is
/// not reachable.
async fn connect(test_name: &str) -> Option<RedisStore> {
    let prefix = format!(
        "turnstile-test:{}:{}:",
        test_name,
        SystemClock::new().now_ms()
    );
    match RedisStore::connect(&redis_url(), &prefix).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Skipping test: Redis not available ({})", e);
            None
        }
    }
}

fn engine(store: RedisStore, profile: ProfileConfig) -> (AdmissionEngine, Arc<ManualClock>) {
    let mut config = AppConfig {
        profiles: vec![profile],
        ..AppConfig::default()
    };
    config.store.timeout_ms = 2_000;
    let clock = Arc::new(ManualClock::default());
    let engine = AdmissionEngine::builder(config)
        .store(Arc::new(store))
        .clock(clock.clone())
        .build()
        .expect("engine builds");
    (engine, clock)
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

#[tokio::test]
#[ignore] // Requires Redis
async fn counter_admits_five_then_rejects() {
    let Some(store) = connect("counter").await else {
        return;
    };
    let (engine, _) = engine(store, profile("login", "/api/auth/login", 5));
    let req = RequestDescriptor::new("POST", "/api/auth/login", "198.51.100.7");

    for i in 0..5 {
        assert!(engine.decide(&req).await.admitted, "request {}", i + 1);
    }
    let rejected = engine.decide(&req).await;
    assert!(!rejected.admitted);
    assert_eq!(rejected.reason, Some(RejectReason::QuotaExhausted));
    assert_eq!(rejected.current, 6);
    assert!((60..=65).contains(&rejected.retry_after_secs.unwrap()));

    let stats = engine.stats("ip=198.51.x.x").await.unwrap();
    assert_eq!(stats.limits[0].count, Some(6));
    assert!(stats.limits[0].expires_in_ms <= 60_000);
    assert_eq!(engine.breaker().state, CircuitState::Closed);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn bucket_bursts_seven_and_refills_after_twelve_seconds() {
    let Some(store) = connect("bucket").await else {
        return;
    };
    let mut search = profile("search", "/api/search", 5);
    search.algorithm = AlgorithmKind::TokenBucket;
    let (engine, clock) = engine(store, search);
    let req = RequestDescriptor::new("GET", "/api/search", "198.51.100.7");

    for i in 0..7 {
        assert!(engine.decide(&req).await.admitted, "burst request {}", i + 1);
    }
    let rejected = engine.decide(&req).await;
    assert!(!rejected.admitted);
    assert_eq!(rejected.reason, Some(RejectReason::BucketEmpty));

    clock.advance(Duration::from_secs(12));
    assert!(engine.decide(&req).await.admitted);
    assert!(!engine.decide(&req).await.admitted);

    let stats = engine.stats("ip=198.51.x.x").await.unwrap();
    let tokens = stats.limits[0].tokens.unwrap();
    assert!((tokens - 0.5).abs() < 1e-9, "tokens {}", tokens);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn penalty_level_is_capped() {
    let Some(store) = connect("penalty").await else {
        return;
    };
    let key = StoreKey::new(RecordKind::Penalty, "api", "ip=1.2.x.x");
    let decay = Duration::from_secs(3600);

    assert_eq!(store.penalty_level(&key, 0).await.unwrap(), 0);
    for expected in [1, 2, 3, 3] {
        assert_eq!(store.record_violation(&key, 3, decay, 0).await.unwrap(), expected);
    }
    assert_eq!(store.penalty_level(&key, 0).await.unwrap(), 3);

    let stats = store.stats("ip=1.2.x.x", 0).await.unwrap();
    assert_eq!(stats.penalties[0].level, 3);
    assert_eq!(stats.penalties[0].multiplier, 8);
    assert!(stats.penalties[0].expires_in_ms > 3_590_000);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn suspicious_flag_is_set_once() {
    let Some(store) = connect("suspicious").await else {
        return;
    };
    let key = StoreKey::new(RecordKind::Suspicious, "api", "ip=1.2.x.x");
    let ttl = Duration::from_secs(60);

    assert!(store.flag_suspicious(&key, ttl, 0).await.unwrap());
    assert!(!store.flag_suspicious(&key, ttl, 0).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn reset_clears_every_record_of_the_identity() {
    let Some(store) = connect("reset").await else {
        return;
    };
    let mut api = profile("api", "/api/*", 2);
    api.progressive_penalty = true;
    let (engine, _) = engine(store, api);
    let req = RequestDescriptor::new("GET", "/api/x", "192.0.2.99");
    let other = RequestDescriptor::new("GET", "/api/x", "203.0.113.5");

    for _ in 0..3 {
        engine.decide(&req).await;
    }
    engine.decide(&other).await;

    let stats = engine.stats("ip=192.0.x.x").await.unwrap();
    assert_eq!(stats.limits[0].count, Some(3));
    assert_eq!(stats.penalties[0].level, 1);
    assert_eq!(stats.suspicious, vec!["api".to_string()]);

    // Counter, penalty and suspicious flag.
    assert_eq!(engine.reset_key("ip=192.0.x.x").await.unwrap(), 3);
    assert!(engine.stats("ip=192.0.x.x").await.unwrap().is_empty());
    assert_eq!(
        engine.stats("ip=203.0.x.x").await.unwrap().limits[0].count,
        Some(1)
    );

    let fresh = engine.decide(&req).await;
    assert!(fresh.admitted);
    assert_eq!(fresh.current, 1);
}
