//! Configuration and error types shared by every Turnstile crate.

pub mod config;
pub mod error;

pub use config::*;
pub use error::{TurnstileError, TurnstileResult};
