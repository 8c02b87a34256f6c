use std::time::Duration;

use async_trait::async_trait;

use crate::admission::{ceil_secs, Admission, AdmissionOutcome};
use crate::circuit_breaker::GuardedStore;
use crate::policy::PolicyProfile;
use crate::store::{RecordKind, StoreKey};

/// Fixed-window counter admission.
///
/// Every attempt increments the window counter, rejected ones included, so a
/// caller hammering a closed window keeps it saturated until it expires.
/// The window starts at the first request and lasts the profile's window.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedWindow;

#[async_trait]
impl Admission for FixedWindow {
    async fn admit(
        &self,
        store: &GuardedStore,
        profile: &PolicyProfile,
        identity: &str,
        limit: u64,
        now_ms: u64,
    ) -> AdmissionOutcome {
        let key = StoreKey::new(RecordKind::Counter, &profile.name, identity);
        let record = store.increment(&key, profile.window, now_ms).await;

        let admitted = record.count <= limit;
        let reset_ms = record.reset_at_ms.saturating_sub(now_ms);
        let retry_after = if admitted {
            None
        } else {
            Some(ceil_secs(reset_ms).max(Duration::from_secs(1)))
        };

        AdmissionOutcome {
            admitted,
            limit,
            current: record.count,
            remaining: limit.saturating_sub(record.count),
            reset_after: Duration::from_millis(reset_ms),
            retry_after,
        }
    }
}
