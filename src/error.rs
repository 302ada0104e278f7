//! QuizCluster Error Types

use thiserror::Error;

use crate::replication::Version;

/// Result type alias for QuizCluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// QuizCluster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Replication errors
    #[error("Replication desynchronized: local version {local}, received version {remote}")]
    Desynchronized { local: Version, remote: Version },

    #[error("Deposed: directory reports {primary} as primary")]
    Deposed { primary: String },

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    // Directory errors
    #[error("No server available")]
    NoServer,

    #[error("Not primary")]
    NotPrimary,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Disconnected from server")]
    Disconnected,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::NoServer
                | Error::Disconnected
        )
    }

    /// Check if this error ends the node for good (restart and re-bootstrap required)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Desynchronized { .. } | Error::Deposed { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, ref msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            other => Error::Store(format!("SQLite error: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NoServer.is_retryable());
        assert!(Error::ConnectionTimeout("127.0.0.1:1".into()).is_retryable());
        assert!(!Error::NoServer.is_fatal());

        let desync = Error::Desynchronized { local: 3, remote: 5 };
        assert!(desync.is_fatal());
        assert!(!desync.is_retryable());
        assert_eq!(
            desync.to_string(),
            "Replication desynchronized: local version 3, received version 5"
        );
    }
}
