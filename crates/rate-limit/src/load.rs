//! Load-adaptive limits.
//!
//! The effective limit shrinks quadratically as the system load approaches
//! the configured threshold and bottoms out at a fixed fraction of the base.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use turnstile_common::LoadConfig;

/// Absorbs float noise such as `100.0 * 0.3 == 29.999999999999996`.
const FLOOR_EPSILON: f64 = 1e-9;

fn floor(value: f64) -> u64 {
    (value + FLOOR_EPSILON).floor().max(0.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAdjuster {
    threshold: f64,
    min_fraction: f64,
}

impl LoadAdjuster {
    pub fn new(threshold: f64, min_fraction: f64) -> Self {
        Self {
            threshold,
            min_fraction,
        }
    }

    pub fn from_config(config: &LoadConfig) -> Self {
        Self::new(config.threshold, config.min_fraction)
    }

    /// `max(floor(base * (1 - f^2)), floor(base * min_fraction))` with
    /// `f = clamp(load / threshold, 0, 1)`. No sample leaves `base` as is.
    pub fn adjusted_limit(&self, base: u64, load: Option<f64>) -> u64 {
        let Some(load) = load else {
            return base;
        };
        let factor = (load / self.threshold).clamp(0.0, 1.0);
        let adjustment = 1.0 - factor * factor;
        let base_f = base as f64;
        floor(base_f * adjustment).max(floor(base_f * self.min_fraction))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum LoadSampleError {
    #[error("load sample must be finite, got {0}")]
    NotFinite(f64),
    #[error("load sample must not be negative, got {0}")]
    Negative(f64),
}

/// The most recent load sample, pushed from outside the engine.
#[derive(Debug)]
pub struct LoadSignal {
    /// `f64` bits; NaN means no sample.
    value: AtomicU64,
    updated_ms: AtomicU64,
    max_age_ms: u64,
}

impl LoadSignal {
    pub fn new(max_age: Duration) -> Self {
        Self {
            value: AtomicU64::new(f64::NAN.to_bits()),
            updated_ms: AtomicU64::new(0),
            max_age_ms: max_age.as_millis() as u64,
        }
    }

    pub fn from_config(config: &LoadConfig) -> Self {
        Self::new(Duration::from_secs(config.max_age_secs))
    }

    pub fn set(&self, load: f64, now_ms: u64) -> Result<(), LoadSampleError> {
        if !load.is_finite() {
            return Err(LoadSampleError::NotFinite(load));
        }
        if load < 0.0 {
            return Err(LoadSampleError::Negative(load));
        }
        self.updated_ms.store(now_ms, Ordering::Release);
        self.value.store(load.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn clear(&self) {
        self.value.store(f64::NAN.to_bits(), Ordering::Release);
    }

    /// The current sample, unless absent or older than the maximum age.
    pub fn current(&self, now_ms: u64) -> Option<f64> {
        let value = f64::from_bits(self.value.load(Ordering::Acquire));
        if value.is_nan() {
            return None;
        }
        let age = now_ms.saturating_sub(self.updated_ms.load(Ordering::Acquire));
        if self.max_age_ms > 0 && age > self.max_age_ms {
            return None;
        }
        Some(value)
    }
}
