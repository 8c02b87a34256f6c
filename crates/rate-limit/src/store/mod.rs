//! Counter store abstraction.
//!
//! Every per-key mutation the engine performs is a single call on a
//! [`CounterStore`]; implementations must make each call atomic for its key
//! so that concurrent callers (threads or engine instances) never race.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::policy::Algorithm;
use crate::token_bucket::BucketParams;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed store reply: {0}")]
    Protocol(String),
}

/// Record family a stored key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Counter,
    Bucket,
    Penalty,
    Suspicious,
}

impl RecordKind {
    pub fn tag(&self) -> &'static str {
        match self {
            RecordKind::Counter => "cnt",
            RecordKind::Bucket => "tb",
            RecordKind::Penalty => "pen",
            RecordKind::Suspicious => "sus",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "cnt" => Some(RecordKind::Counter),
            "tb" => Some(RecordKind::Bucket),
            "pen" => Some(RecordKind::Penalty),
            "sus" => Some(RecordKind::Suspicious),
            _ => None,
        }
    }
}

/// Address of one stored record: `{kind}:{profile}:{identity}`.
///
/// Profile names never contain `:`, so the identity is everything after the
/// second separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub kind: RecordKind,
    pub profile: String,
    pub identity: String,
}

impl StoreKey {
    pub fn new(kind: RecordKind, profile: &str, identity: &str) -> Self {
        Self {
            kind,
            profile: profile.to_string(),
            identity: identity.to_string(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, rest) = raw.split_once(':')?;
        let (profile, identity) = rest.split_once(':')?;
        Some(Self {
            kind: RecordKind::from_tag(kind)?,
            profile: profile.to_string(),
            identity: identity.to_string(),
        })
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.tag(), self.profile, self.identity)
    }
}

/// Fixed-window counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    pub count: u64,
    pub window_start_ms: u64,
    pub reset_at_ms: u64,
}

/// Result of one atomic token-bucket take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub admitted: bool,
    /// Tokens left after this call.
    pub tokens: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStat {
    pub profile: String,
    pub algorithm: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Tokens as of the last refill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<f64>,
    pub expires_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PenaltyStat {
    pub profile: String,
    pub level: u32,
    pub multiplier: u64,
    pub expires_in_ms: u64,
}

/// Operator view of everything stored for one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyStats {
    pub limits: Vec<LimitStat>,
    pub penalties: Vec<PenaltyStat>,
    /// Profiles under which the identity is currently flagged.
    pub suspicious: Vec<String>,
}

impl KeyStats {
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.penalties.is_empty() && self.suspicious.is_empty()
    }

    /// Fold another view in, keeping the entry with the longer lifetime on
    /// duplicates.
    pub fn merge(&mut self, other: KeyStats) {
        for limit in other.limits {
            match self
                .limits
                .iter_mut()
                .find(|l| l.profile == limit.profile && l.algorithm == limit.algorithm)
            {
                Some(existing) if existing.expires_in_ms >= limit.expires_in_ms => {}
                Some(existing) => *existing = limit,
                None => self.limits.push(limit),
            }
        }
        for penalty in other.penalties {
            match self.penalties.iter_mut().find(|p| p.profile == penalty.profile) {
                Some(existing) if existing.level >= penalty.level => {}
                Some(existing) => *existing = penalty,
                None => self.penalties.push(penalty),
            }
        }
        for profile in other.suspicious {
            if !self.suspicious.contains(&profile) {
                self.suspicious.push(profile);
            }
        }
        self.sort();
    }

    pub(crate) fn sort(&mut self) {
        self.limits.sort_by(|a, b| a.profile.cmp(&b.profile));
        self.penalties.sort_by(|a, b| a.profile.cmp(&b.profile));
        self.suspicious.sort();
    }
}

/// A shared counter store. All timestamps are milliseconds since the epoch,
/// supplied by the caller's clock.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Atomically increment-or-create a fixed-window counter whose TTL is
    /// `window` from its first write.
    async fn increment(
        &self,
        key: &StoreKey,
        window: Duration,
        now_ms: u64,
    ) -> Result<CounterRecord, StoreError>;

    /// Atomically refill and, if at least one token is available, consume one.
    async fn take_token(
        &self,
        key: &StoreKey,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Current penalty level, zero when absent or decayed.
    async fn penalty_level(&self, key: &StoreKey, now_ms: u64) -> Result<u32, StoreError>;

    /// Raise the penalty level by one (capped) and restart its decay TTL.
    /// Returns the new level.
    async fn record_violation(
        &self,
        key: &StoreKey,
        max_level: u32,
        decay: Duration,
        now_ms: u64,
    ) -> Result<u32, StoreError>;

    /// Set the suspicious flag unless it is already set. Returns `true` when
    /// this call set it.
    async fn flag_suspicious(
        &self,
        key: &StoreKey,
        ttl: Duration,
        now_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Delete every record stored for `identity`, across profiles and kinds.
    async fn reset_identity(&self, identity: &str) -> Result<usize, StoreError>;

    async fn stats(&self, identity: &str, now_ms: u64) -> Result<KeyStats, StoreError>;
}
