/// Error types for the realtime messaging core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Cancellations are expected while capability flips and are not surfaced to users
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout(e.to_string())
        } else {
            SyncError::Http(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
