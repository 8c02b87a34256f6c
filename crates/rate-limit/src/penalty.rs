//! Progressive penalties for repeat offenders.
//!
//! Each rejection raises a key's level by one, up to a cap, and restarts a
//! decay timer. The key's quota is divided by `2^level` until the level
//! decays back to zero after a full decay window without violations.

use std::time::Duration;

use turnstile_common::PenaltyConfig;

use crate::circuit_breaker::GuardedStore;
use crate::store::StoreKey;

/// Quota divisor for a level.
pub fn multiplier(level: u32) -> u64 {
    1u64.checked_shl(level).unwrap_or(u64::MAX)
}

/// Quota left after applying a level, before the floor of one.
pub fn apply(limit: u64, level: u32) -> u64 {
    limit / multiplier(level)
}

#[derive(Debug, Clone, Copy)]
pub struct PenaltyTracker {
    max_level: u32,
    decay: Duration,
}

impl PenaltyTracker {
    pub fn new(max_level: u32, decay: Duration) -> Self {
        Self { max_level, decay }
    }

    pub fn from_config(config: &PenaltyConfig) -> Self {
        Self::new(config.max_level, Duration::from_secs(config.decay_secs))
    }

    pub async fn level(&self, store: &GuardedStore, key: &StoreKey, now_ms: u64) -> u32 {
        store.penalty_level(key, now_ms).await.min(self.max_level)
    }

    /// Record one violation and return the new level.
    pub async fn record_violation(&self, store: &GuardedStore, key: &StoreKey, now_ms: u64) -> u32 {
        store
            .record_violation(key, self.max_level, self.decay, now_ms)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::{MemoryStore, RecordKind};

    #[test]
    fn multiplier_doubles_per_level() {
        assert_eq!(multiplier(0), 1);
        assert_eq!(multiplier(3), 8);
        assert_eq!(multiplier(64), u64::MAX);
    }

    #[test]
    fn apply_floors() {
        assert_eq!(apply(100, 0), 100);
        assert_eq!(apply(100, 3), 12);
        assert_eq!(apply(5, 3), 0);
    }

    #[tokio::test]
    async fn escalates_to_cap_then_decays() {
        let store = GuardedStore::local_only(Arc::new(MemoryStore::new()));
        let tracker = PenaltyTracker::new(5, Duration::from_secs(3600));
        let key = StoreKey::new(RecordKind::Penalty, "api", "ip=1.2.x.x");

        for expected in 1..=5 {
            assert_eq!(tracker.record_violation(&store, &key, 0).await, expected);
        }
        assert_eq!(tracker.record_violation(&store, &key, 0).await, 5);
        assert_eq!(tracker.level(&store, &key, 3_599_000).await, 5);
        assert_eq!(tracker.level(&store, &key, 3_600_000).await, 0);
    }

    #[tokio::test]
    async fn new_violation_restarts_decay() {
        let store = GuardedStore::local_only(Arc::new(MemoryStore::new()));
        let tracker = PenaltyTracker::new(5, Duration::from_secs(3600));
        let key = StoreKey::new(RecordKind::Penalty, "api", "ip=1.2.x.x");

        assert_eq!(tracker.record_violation(&store, &key, 0).await, 1);
        assert_eq!(tracker.record_violation(&store, &key, 3_000_000).await, 2);

        // Past the first violation's decay, inside the second's.
        assert_eq!(tracker.level(&store, &key, 3_700_000).await, 2);
        let stats = store.stats("ip=1.2.x.x", 3_700_000).await.unwrap();
        assert_eq!(stats.penalties[0].expires_in_ms, 2_900_000);

        assert_eq!(tracker.level(&store, &key, 6_599_999).await, 2);
        assert_eq!(tracker.level(&store, &key, 6_600_000).await, 0);
    }
}
