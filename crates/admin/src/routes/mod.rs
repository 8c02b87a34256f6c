pub mod breaker;
pub mod check;
pub mod health;
pub mod keys;
pub mod load;
pub mod metrics;
pub mod profiles;
