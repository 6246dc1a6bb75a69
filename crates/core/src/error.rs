//! Error types for PeerMesh Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No handler for frame type '{0}'")]
    UnhandledFrame(String),

    #[error("Handler already registered for frame type '{0}'")]
    DuplicateHandler(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Cannot change shared data while a sync point is pending")]
    SyncInProgress,

    #[error("A wait is already pending")]
    WaitPending,

    #[error("Wait cancelled before completion")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
