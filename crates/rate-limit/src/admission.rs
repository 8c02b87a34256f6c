//! The common interface of the two admission algorithms.

use std::time::Duration;

use async_trait::async_trait;

use crate::circuit_breaker::GuardedStore;
use crate::policy::PolicyProfile;

/// Outcome of one admission attempt, before penalties and telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionOutcome {
    pub admitted: bool,
    /// Effective limit the attempt was judged against.
    pub limit: u64,
    /// Units of quota consumed in the current window or bucket.
    pub current: u64,
    pub remaining: u64,
    /// Time until the window resets or the bucket is full again.
    pub reset_after: Duration,
    /// Earliest useful retry, only set on rejection.
    pub retry_after: Option<Duration>,
}

impl AdmissionOutcome {
    /// Fraction of the limit in use, in `[0, ∞)`.
    pub fn utilisation(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        self.current as f64 / self.limit as f64
    }
}

/// An admission algorithm. Implementations perform exactly one atomic store
/// operation per call.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn admit(
        &self,
        store: &GuardedStore,
        profile: &PolicyProfile,
        identity: &str,
        limit: u64,
        now_ms: u64,
    ) -> AdmissionOutcome;
}

/// Round a millisecond span up to whole seconds.
pub(crate) fn ceil_secs(ms: u64) -> Duration {
    Duration::from_secs(ms.div_ceil(1000))
}
