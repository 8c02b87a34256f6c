use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    BucketOutcome, CounterRecord, CounterStore, KeyStats, LimitStat, PenaltyStat, RecordKind,
    StoreError, StoreKey,
};
use crate::penalty;
use crate::policy::Algorithm;
use crate::token_bucket::BucketParams;

struct CounterEntry {
    count: u64,
    window_start_ms: u64,
    expires_at_ms: u64,
}

struct BucketEntry {
    tokens: f64,
    last_refill_ms: u64,
    expires_at_ms: u64,
}

struct PenaltyEntry {
    level: u32,
    expires_at_ms: u64,
}

/// Process-local counter store.
///
/// Each record lives in a [`DashMap`] entry; holding the entry guard for the
/// whole read-modify-write makes every operation atomic per key. Expired
/// records are treated as absent on access and removed by
/// [`purge_expired`](MemoryStore::purge_expired).
#[derive(Default)]
pub struct MemoryStore {
    counters: DashMap<StoreKey, CounterEntry>,
    buckets: DashMap<StoreKey, BucketEntry>,
    penalties: DashMap<StoreKey, PenaltyEntry>,
    flags: DashMap<StoreKey, u64>,
}

fn ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_local(&self, key: &StoreKey, window: Duration, now_ms: u64) -> CounterRecord {
        let fresh = || CounterEntry {
            count: 0,
            window_start_ms: now_ms,
            expires_at_ms: now_ms + ms(window),
        };

        let mut entry = self.counters.entry(key.clone()).or_insert_with(fresh);
        if now_ms >= entry.expires_at_ms {
            *entry = fresh();
        }
        entry.count += 1;

        CounterRecord {
            count: entry.count,
            window_start_ms: entry.window_start_ms,
            reset_at_ms: entry.expires_at_ms,
        }
    }

    pub fn take_token_local(&self, key: &StoreKey, params: &BucketParams, now_ms: u64) -> BucketOutcome {
        let ttl = ms(params.ttl());
        let full = || BucketEntry {
            tokens: params.capacity(),
            last_refill_ms: now_ms,
            expires_at_ms: now_ms + ttl,
        };

        let mut entry = self.buckets.entry(key.clone()).or_insert_with(full);
        if now_ms >= entry.expires_at_ms {
            *entry = full();
        }

        let available = params.refill(entry.tokens, entry.last_refill_ms, now_ms);
        if available >= 1.0 {
            entry.tokens = available - 1.0;
            entry.last_refill_ms = now_ms;
            entry.expires_at_ms = now_ms + ttl;
            BucketOutcome {
                admitted: true,
                tokens: entry.tokens,
            }
        } else {
            BucketOutcome {
                admitted: false,
                tokens: available,
            }
        }
    }

    pub fn penalty_level_local(&self, key: &StoreKey, now_ms: u64) -> u32 {
        self.penalties
            .get(key)
            .filter(|p| now_ms < p.expires_at_ms)
            .map(|p| p.level)
            .unwrap_or(0)
    }

    pub fn record_violation_local(
        &self,
        key: &StoreKey,
        max_level: u32,
        decay: Duration,
        now_ms: u64,
    ) -> u32 {
        let mut entry = self.penalties.entry(key.clone()).or_insert(PenaltyEntry {
            level: 0,
            expires_at_ms: 0,
        });
        if now_ms >= entry.expires_at_ms {
            entry.level = 0;
        }
        entry.level = (entry.level + 1).min(max_level);
        entry.expires_at_ms = now_ms + ms(decay);
        entry.level
    }

    pub fn flag_suspicious_local(&self, key: &StoreKey, ttl: Duration, now_ms: u64) -> bool {
        let mut entry = self.flags.entry(key.clone()).or_insert(0);
        if now_ms < *entry {
            return false;
        }
        *entry = now_ms + ms(ttl);
        true
    }

    pub fn reset_identity_local(&self, identity: &str) -> usize {
        fn drain<V>(map: &DashMap<StoreKey, V>, identity: &str) -> usize {
            let mut removed = 0;
            map.retain(|key, _| {
                let keep = key.identity != identity;
                removed += usize::from(!keep);
                keep
            });
            removed
        }

        drain(&self.counters, identity)
            + drain(&self.buckets, identity)
            + drain(&self.penalties, identity)
            + drain(&self.flags, identity)
    }

    pub fn stats_local(&self, identity: &str, now_ms: u64) -> KeyStats {
        let mut stats = KeyStats::default();

        for entry in self.counters.iter() {
            if entry.key().identity == identity && now_ms < entry.expires_at_ms {
                stats.limits.push(LimitStat {
                    profile: entry.key().profile.clone(),
                    algorithm: Algorithm::Counter,
                    count: Some(entry.count),
                    tokens: None,
                    expires_in_ms: entry.expires_at_ms - now_ms,
                });
            }
        }
        for entry in self.buckets.iter() {
            if entry.key().identity == identity && now_ms < entry.expires_at_ms {
                stats.limits.push(LimitStat {
                    profile: entry.key().profile.clone(),
                    algorithm: Algorithm::TokenBucket,
                    count: None,
                    tokens: Some(entry.tokens),
                    expires_in_ms: entry.expires_at_ms - now_ms,
                });
            }
        }
        for entry in self.penalties.iter() {
            if entry.key().identity == identity && now_ms < entry.expires_at_ms {
                stats.penalties.push(PenaltyStat {
                    profile: entry.key().profile.clone(),
                    level: entry.level,
                    multiplier: penalty::multiplier(entry.level),
                    expires_in_ms: entry.expires_at_ms - now_ms,
                });
            }
        }
        for entry in self.flags.iter() {
            if entry.key().identity == identity && now_ms < *entry.value() {
                stats.suspicious.push(entry.key().profile.clone());
            }
        }

        stats.sort();
        stats
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.len();
        self.counters.retain(|_, e| now_ms < e.expires_at_ms);
        self.buckets.retain(|_, e| now_ms < e.expires_at_ms);
        self.penalties.retain(|_, e| now_ms < e.expires_at_ms);
        self.flags.retain(|_, expires_at| now_ms < *expires_at);
        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            tracing::debug!(removed, "purged expired local records");
        }
        removed
    }

    /// Number of records held, expired ones included.
    pub fn len(&self) -> usize {
        self.counters.len() + self.buckets.len() + self.penalties.len() + self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any record of `kind` exists for `identity`.
    pub fn contains(&self, kind: RecordKind, identity: &str) -> bool {
        let matches = |key: &StoreKey| key.kind == kind && key.identity == identity;
        match kind {
            RecordKind::Counter => self.counters.iter().any(|e| matches(e.key())),
            RecordKind::Bucket => self.buckets.iter().any(|e| matches(e.key())),
            RecordKind::Penalty => self.penalties.iter().any(|e| matches(e.key())),
            RecordKind::Suspicious => self.flags.iter().any(|e| matches(e.key())),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn increment(
        &self,
        key: &StoreKey,
        window: Duration,
        now_ms: u64,
    ) -> Result<CounterRecord, StoreError> {
        Ok(self.increment_local(key, window, now_ms))
    }

    async fn take_token(
        &self,
        key: &StoreKey,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        Ok(self.take_token_local(key, params, now_ms))
    }

    async fn penalty_level(&self, key: &StoreKey, now_ms: u64) -> Result<u32, StoreError> {
        Ok(self.penalty_level_local(key, now_ms))
    }

    async fn record_violation(
        &self,
        key: &StoreKey,
        max_level: u32,
        decay: Duration,
        now_ms: u64,
    ) -> Result<u32, StoreError> {
        Ok(self.record_violation_local(key, max_level, decay, now_ms))
    }

    async fn flag_suspicious(
        &self,
        key: &StoreKey,
        ttl: Duration,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        Ok(self.flag_suspicious_local(key, ttl, now_ms))
    }

    async fn reset_identity(&self, identity: &str) -> Result<usize, StoreError> {
        Ok(self.reset_identity_local(identity))
    }

    async fn stats(&self, identity: &str, now_ms: u64) -> Result<KeyStats, StoreError> {
        Ok(self.stats_local(identity, now_ms))
    }
}
