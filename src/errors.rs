//! Error types for the hub
//!
//! Protocol-level decode failures are deliberately *not* represented here:
//! a text frame that fails to parse is delivered as a synthetic `"error"`
//! event and the connection stays open.

use crate::connection::ConnectionId;
use thiserror::Error;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Boxed error produced by user socket handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hub errors
#[derive(Error, Debug)]
pub enum HubError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("server startup failed: {message}")]
    Startup { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl HubError {
    /// Create a configuration error
    pub fn config<T: Into<String>>(message: T) -> Self {
        HubError::Config {
            message: message.into(),
        }
    }

    /// Create a startup error
    pub fn startup<T: Into<String>>(message: T) -> Self {
        HubError::Startup {
            message: message.into(),
        }
    }
}
