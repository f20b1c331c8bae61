use std::time::Duration;

use thiserror::Error;

/// Failure to open the signaling channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Timed out after {0:?} connecting to the signaling server")]
    Timeout(Duration),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Signaling server unreachable: {0}")]
    Unreachable(String),

    #[error("Signaling channel is already connected")]
    AlreadyConnected,

    #[error("Signaling channel was shut down")]
    Shutdown,
}

/// Failure reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The connection is in a signaling state that forbids the operation
    #[error("Invalid signaling state: {0}")]
    StateConflict(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Media connection is closed")]
    Closed,

    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Data channel error: {0}")]
    DataChannel(String),

    #[error("Media engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors that leave the connection unusable for further negotiation.
    ///
    /// These trigger connection recovery; any other engine error only abandons
    /// the current round.
    #[must_use]
    pub const fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_) | Self::Closed)
    }
}

/// Failure to rebuild the media connection after a state conflict
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Failed to recreate media connection: {0}")]
    Reset(EngineError),

    #[error("Failed to re-attach local media: {0}")]
    Reattach(EngineError),

    #[error("Session closed before the connection could be rebuilt")]
    Closed,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Session is closed")]
    Closed,

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Core(#[from] tandem_core::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(tandem_core::Error::Serialization(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
