use std::time::Duration;

use async_trait::async_trait;

use crate::admission::{ceil_secs, Admission, AdmissionOutcome};
use crate::circuit_breaker::GuardedStore;
use crate::policy::PolicyProfile;
use crate::store::{RecordKind, StoreKey};

/// Burst headroom over the nominal per-window limit.
pub const BURST_FACTOR: f64 = 1.5;

/// Shape of one token bucket, derived from an effective limit and window.
///
/// The bucket holds up to `limit * 1.5` tokens and refills at `limit` tokens
/// per window. Refill arithmetic is done in milliseconds so that a refill of
/// exactly one window's share of tokens is exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub limit: u64,
    pub window_ms: u64,
}

impl BucketParams {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window_ms: (window.as_millis() as u64).max(1),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.limit as f64 * BURST_FACTOR
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.limit as f64 * 1000.0 / self.window_ms as f64
    }

    /// Token level at `now_ms` for a bucket last refilled at `last_ms`.
    pub fn refill(&self, tokens: f64, last_ms: u64, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(last_ms) as f64;
        let gained = elapsed_ms * self.limit as f64 / self.window_ms as f64;
        (tokens + gained).min(self.capacity())
    }

    /// Milliseconds until the bucket holds `target` tokens again.
    pub fn ms_until(&self, tokens: f64, target: f64) -> u64 {
        let missing = (target - tokens).max(0.0);
        (missing * self.window_ms as f64 / self.limit as f64).ceil() as u64
    }

    /// Lifetime of an idle bucket record: an empty bucket is full again after
    /// this long, so dropping it is equivalent to keeping it.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ms_until(0.0, self.capacity()).max(1))
    }
}

/// Token bucket admission. A new bucket starts full.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenBucket;

#[async_trait]
impl Admission for TokenBucket {
    async fn admit(
        &self,
        store: &GuardedStore,
        profile: &PolicyProfile,
        identity: &str,
        limit: u64,
        now_ms: u64,
    ) -> AdmissionOutcome {
        let params = BucketParams::new(limit, profile.window);
        let key = StoreKey::new(RecordKind::Bucket, &profile.name, identity);
        let taken = store.take_token(&key, &params, now_ms).await;

        let burst = params.capacity().floor() as u64;
        let remaining = (taken.tokens.max(0.0).floor() as u64).min(burst);
        let retry_after = if taken.admitted {
            None
        } else {
            Some(ceil_secs(params.ms_until(taken.tokens, 1.0)).max(Duration::from_secs(1)))
        };

        AdmissionOutcome {
            admitted: taken.admitted,
            limit: params.limit,
            current: burst - remaining,
            remaining,
            reset_after: Duration::from_millis(params.ms_until(taken.tokens, params.capacity())),
            retry_after,
        }
    }
}
