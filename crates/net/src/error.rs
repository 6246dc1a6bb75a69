//! Network error types

use std::io;

use peermesh_core::EndpointId;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel '{0}' is closed")]
    ChannelClosed(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    #[error("Endpoint {0} is already connected")]
    DuplicateEndpoint(EndpointId),

    #[error("Refusing to connect to self")]
    SelfConnection,

    #[error("Remote endpoint already set to {current}, cannot set {attempted}")]
    RemoteAlreadySet {
        current: EndpointId,
        attempted: EndpointId,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Signaling relay unavailable")]
    RelayUnavailable,

    #[error(transparent)]
    Core(#[from] peermesh_core::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Core(peermesh_core::Error::Serialization(e))
    }
}
