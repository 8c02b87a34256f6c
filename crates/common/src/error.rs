use thiserror::Error;

#[derive(Debug, Error)]
pub enum TurnstileError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid profile '{profile}': {message}")]
    InvalidProfile { profile: String, message: String },
}

impl TurnstileError {
    pub fn profile(profile: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidProfile {
            profile: profile.into(),
            message: message.into(),
        }
    }
}

pub type TurnstileResult<T> = Result<T, TurnstileError>;
