//! Adaptive admission control for Turnstile.
//!
//! The [`AdmissionEngine`] decides, per request, whether a caller may
//! proceed. Requests are classified to a policy profile, keyed by an
//! anonymized identity, and admitted by one of two algorithms:
//!
//! - **Fixed-window counter** -- a hard per-window cap, one atomic
//!   increment per request.
//! - **Token bucket** -- bursts up to 1.5x the nominal limit, refilled at
//!   the nominal rate.
//!
//! Effective limits adapt to system load and shrink for repeat offenders.
//! Counters live in a pluggable [`CounterStore`]; calls to a shared store go
//! through a circuit breaker that falls back to an in-process
//! [`MemoryStore`] when the shared store misbehaves.

pub mod admission;
pub mod bypass;
pub mod circuit_breaker;
pub mod clock;
pub mod decision;
pub mod descriptor;
pub mod engine;
pub mod fixed_window;
pub mod identity;
pub mod load;
pub mod penalty;
pub mod policy;
pub mod store;
pub mod telemetry;
pub mod token_bucket;

pub use circuit_breaker::{BreakerSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{BypassKind, Decision, RejectReason};
pub use descriptor::RequestDescriptor;
pub use engine::{AdmissionEngine, EngineBuilder};
pub use load::LoadSampleError;
pub use policy::{Algorithm, ProfileSummary};
pub use store::{CounterStore, KeyStats, MemoryStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use telemetry::{FanoutSink, MemorySink, Severity, TelemetryEvent, TelemetrySink, TracingSink};
