use std::sync::Arc;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use turnstile_rate_limit::{AdmissionEngine, CircuitState, TelemetryEvent, TelemetrySink};

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// State shared by the admin handlers.
pub struct AppState {
    pub engine: Arc<AdmissionEngine>,
    pub metrics: Arc<EngineMetrics>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// `metrics` should be the same instance the engine reports to.
    pub fn new(engine: Arc<AdmissionEngine>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            engine,
            metrics,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Prometheus view of engine telemetry.
pub struct EngineMetrics {
    pub registry: Registry,
    pub decisions_total: IntCounterVec,
    pub rejections_total: IntCounterVec,
    pub suspected_abuse_total: IntCounterVec,
    pub penalty_escalations_total: IntCounterVec,
    pub breaker_transitions_total: IntCounterVec,
    pub breaker_state: IntGauge,
    pub check_duration: Histogram,
}

impl EngineMetrics {
    /// Create every collector and register it against a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new("turnstile_decisions_total", "Admission decisions by profile and outcome"),
            &["profile", "outcome"],
        )?;
        let rejections_total = IntCounterVec::new(
            Opts::new("turnstile_rejections_total", "Rejected requests by profile and reason"),
            &["profile", "reason"],
        )?;
        let suspected_abuse_total = IntCounterVec::new(
            Opts::new(
                "turnstile_suspected_abuse_total",
                "Keys that crossed the suspicious fraction of their limit",
            ),
            &["profile"],
        )?;
        let penalty_escalations_total = IntCounterVec::new(
            Opts::new("turnstile_penalty_escalations_total", "Penalty level increases"),
            &["profile"],
        )?;
        let breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "turnstile_breaker_transitions_total",
                "Circuit breaker transitions by target state",
            ),
            &["to"],
        )?;
        let breaker_state = IntGauge::with_opts(Opts::new(
            "turnstile_breaker_state",
            "Circuit breaker state (0 closed, 1 open, 2 half-open)",
        ))?;
        let check_duration = Histogram::with_opts(
            HistogramOpts::new(
                "turnstile_check_duration_seconds",
                "Latency of decisions served through the admin API",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]),
        )?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(suspected_abuse_total.clone()))?;
        registry.register(Box::new(penalty_escalations_total.clone()))?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            decisions_total,
            rejections_total,
            suspected_abuse_total,
            penalty_escalations_total,
            breaker_transitions_total,
            breaker_state,
            check_duration,
        })
    }
}

fn state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

impl TelemetrySink for EngineMetrics {
    fn emit(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::Admitted { profile } => {
                self.decisions_total
                    .with_label_values(&[profile.as_str(), "admitted"])
                    .inc();
            }
            TelemetryEvent::Rejected { profile, reason, .. } => {
                self.decisions_total
                    .with_label_values(&[profile.as_str(), "rejected"])
                    .inc();
                self.rejections_total
                    .with_label_values(&[profile.as_str(), reason.code()])
                    .inc();
            }
            TelemetryEvent::Bypassed { profile, .. } => {
                self.decisions_total
                    .with_label_values(&[profile.as_str(), "bypassed"])
                    .inc();
            }
            TelemetryEvent::SuspectedAbuse { profile, .. } => {
                self.suspected_abuse_total
                    .with_label_values(&[profile.as_str()])
                    .inc();
            }
            TelemetryEvent::PenaltyEscalated { profile, .. } => {
                self.penalty_escalations_total
                    .with_label_values(&[profile.as_str()])
                    .inc();
            }
            TelemetryEvent::BreakerTransition { to, .. } => {
                self.breaker_transitions_total
                    .with_label_values(&[state_label(*to)])
                    .inc();
                self.breaker_state.set(*to as i64);
            }
        }
    }
}
