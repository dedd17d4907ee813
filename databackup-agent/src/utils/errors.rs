//! Error types for the backup/restore session engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Unknown catalog entry: {0}")]
    UnknownEntry(String),

    #[error("Manifest is empty: no valid entries selected")]
    EmptyManifest,

    #[error("Manifest conflict for {id}: {reason}")]
    ManifestConflict { id: String, reason: String },

    #[error("Privileged gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Session is not initialized")]
    NotInitialized,

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("Session cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
