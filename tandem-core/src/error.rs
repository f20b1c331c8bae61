use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    MalformedEnvelope(#[from] MalformedEnvelope),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// An inbound signaling envelope that failed validation.
///
/// Never fatal: the receiver logs and drops the envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed envelope: {reason}")]
pub struct MalformedEnvelope {
    pub reason: String,
}

impl MalformedEnvelope {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for MalformedEnvelope {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
