//! Error types for the AMI session

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AmiError>;

#[derive(Debug, Error)]
pub enum AmiError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Action response timeout")]
    ActionTimeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Session closed")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
