//! Telemetry events and the sinks that consume them.
//!
//! The engine reports every rejection, bypass, penalty escalation,
//! suspected-abuse escalation and circuit-breaker transition as a
//! [`TelemetryEvent`]. Sinks decide what to do with them: [`TracingSink`]
//! logs, the admin crate counts, [`MemorySink`] keeps them for inspection.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::decision::{BypassKind, RejectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Admitted {
        profile: String,
    },
    Rejected {
        profile: String,
        key: String,
        limit: u64,
        current: u64,
        retry_after_secs: u64,
        reason: RejectReason,
        penalty_level: u32,
    },
    Bypassed {
        profile: String,
        kind: BypassKind,
        /// Anonymized remote address.
        addr: String,
    },
    SuspectedAbuse {
        profile: String,
        key: String,
        current: u64,
        limit: u64,
    },
    PenaltyEscalated {
        profile: String,
        key: String,
        level: u32,
    },
    BreakerTransition {
        from: CircuitState,
        to: CircuitState,
        failures: u32,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::Admitted { .. } => "admitted",
            TelemetryEvent::Rejected { .. } => "rejected",
            TelemetryEvent::Bypassed { .. } => "bypassed",
            TelemetryEvent::SuspectedAbuse { .. } => "suspected_abuse",
            TelemetryEvent::PenaltyEscalated { .. } => "penalty_escalated",
            TelemetryEvent::BreakerTransition { .. } => "breaker_transition",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            TelemetryEvent::Admitted { .. } => Severity::Debug,
            TelemetryEvent::Bypassed { .. } => Severity::Info,
            TelemetryEvent::Rejected { .. } | TelemetryEvent::PenaltyEscalated { .. } => {
                Severity::Warn
            }
            TelemetryEvent::SuspectedAbuse { .. } => Severity::Error,
            TelemetryEvent::BreakerTransition { to, .. } => match to {
                CircuitState::Open => Severity::Warn,
                CircuitState::HalfOpen | CircuitState::Closed => Severity::Info,
            },
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Writes events to the `tracing` subscriber at their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::Admitted { profile } => {
                debug!(profile = %profile, "request admitted");
            }
            TelemetryEvent::Rejected {
                profile,
                key,
                limit,
                current,
                retry_after_secs,
                reason,
                penalty_level,
            } => {
                warn!(
                    profile = %profile,
                    key = %key,
                    limit,
                    current,
                    retry_after_secs,
                    reason = %reason,
                    penalty_level,
                    "request rejected"
                );
            }
            TelemetryEvent::Bypassed { profile, kind, addr } => {
                info!(profile = %profile, kind = %kind, addr = %addr, "rate limit bypassed");
            }
            TelemetryEvent::SuspectedAbuse {
                profile,
                key,
                current,
                limit,
            } => {
                error!(
                    profile = %profile,
                    key = %key,
                    current,
                    limit,
                    "suspected abuse: caller is close to its limit"
                );
            }
            TelemetryEvent::PenaltyEscalated { profile, key, level } => {
                warn!(profile = %profile, key = %key, level, "penalty escalated");
            }
            TelemetryEvent::BreakerTransition { from, to, failures } => {
                if *to == CircuitState::Open {
                    warn!(?from, ?to, failures, "circuit breaker opened, using local store");
                } else {
                    info!(?from, ?to, failures, "circuit breaker transition");
                }
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Forwards each event to every inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanoutSink {
    fn emit(&self, event: &TelemetryEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected() -> TelemetryEvent {
        TelemetryEvent::Rejected {
            profile: "login".into(),
            key: "ip=10.0.x.x".into(),
            limit: 5,
            current: 6,
            retry_after_secs: 60,
            reason: RejectReason::QuotaExhausted,
            penalty_level: 1,
        }
    }

    #[test]
    fn severities() {
        assert_eq!(rejected().severity(), Severity::Warn);
        let opened = TelemetryEvent::BreakerTransition {
            from: CircuitState::Closed,
            to: CircuitState::Open,
            failures: 5,
        };
        assert_eq!(opened.severity(), Severity::Warn);
        let abuse = TelemetryEvent::SuspectedAbuse {
            profile: "p".into(),
            key: "k".into(),
            current: 9,
            limit: 10,
        };
        assert!(abuse.severity() > opened.severity());
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let sinks: Vec<Arc<dyn TelemetrySink>> = vec![a.clone(), b.clone(), Arc::new(TracingSink)];
        let fanout = FanoutSink::new(sinks);

        fanout.emit(&rejected());
        assert_eq!(a.count("rejected"), 1);
        assert_eq!(b.events(), vec![rejected()]);
    }

    #[test]
    fn take_drains() {
        let sink = MemorySink::new();
        sink.emit(&rejected());
        assert_eq!(sink.take().len(), 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(rejected()).unwrap();
        assert_eq!(json["event"], "rejected");
        assert_eq!(json["reason"], "quota_exhausted");
    }
}
