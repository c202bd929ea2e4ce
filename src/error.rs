//! Error types for a3s-agent-bridge

use crate::patch::PatchError;
use thiserror::Error;

/// Errors that can occur while orchestrating agent sessions
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Backend connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Session never reached an active state
    #[error("Session bootstrap failed: {0}")]
    Bootstrap(String),

    /// Backend rejected or failed a request
    #[error("Backend error: {0}")]
    Backend(String),

    /// Durable record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No live session for a conversation
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Patch parsing or application failure
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    /// Illegal session status transition
    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// Message or conversation store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure outside of patch application
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
