//! Error types for channel membership operations.

use crate::PeerId;
use crate::overlay::OverlayError;
use thiserror::Error;

/// Errors returned by [`ChannelNode`](crate::ChannelNode) operations.
///
/// Descriptors are rendered in their short display form (`#name`).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Not on the channel {0}")]
    NotJoined(String),

    #[error("Failed to join {descriptor}: {source}")]
    JoinFailed {
        descriptor: String,
        #[source]
        source: OverlayError,
    },

    #[error("Failed to leave {descriptor}: {source}")]
    LeaveFailed {
        descriptor: String,
        #[source]
        source: OverlayError,
    },

    #[error("Failed to find peers for {descriptor}: {source}")]
    DiscoveryFailed {
        descriptor: String,
        #[source]
        source: OverlayError,
    },

    /// Rejoin finished without a single reachable channel member.
    #[error("Failed to connect to any peers for {0}")]
    RejoinFailed(String),

    #[error("Failed to announce {descriptor}: {source}")]
    AnnounceFailed {
        descriptor: String,
        #[source]
        source: OverlayError,
    },

    #[error("Publish to {descriptor} failed: {source}")]
    PublishFailed {
        descriptor: String,
        #[source]
        source: OverlayError,
    },

    #[error("Connect to {peer} failed: {source}")]
    ConnectFailed {
        peer: PeerId,
        #[source]
        source: OverlayError,
    },

    #[error("Ping to {peer} failed: {source}")]
    PingFailed {
        peer: PeerId,
        #[source]
        source: OverlayError,
    },

    #[error("{0} not implemented yet")]
    NotImplemented(&'static str),

    #[error("Node is shutting down")]
    Shutdown,

    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Whether this error was caused by node shutdown rather than a real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ChannelError::Shutdown)
    }
}
