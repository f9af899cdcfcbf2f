//! Error types for every layer of the crate.

use serde_json::Value;

use crate::context::ContextId;
use crate::discovery::Role;

/// The underlying message primitive could not deliver a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("context {0} no longer exists")]
    ContextGone(ContextId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{0} discovery is already in progress, call stop_discovery() first")]
    AlreadyInProgress(Role),

    /// Two servers in one tree would race to issue conflicting tokens.
    #[error("a second discovery server has been detected at {origin}, this is unsupported")]
    SecondServer { origin: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Programmer error: `Bridge::on` was called twice for one method.
    #[error("listener '{0}' already bound in bridge")]
    DuplicateHandler(String),

    #[error("call to {peer} failed: {source}")]
    Channel {
        peer: ContextId,
        #[source]
        source: ChannelError,
    },

    #[error("{peer} replied with error: {error}")]
    Remote { peer: ContextId, error: Value },
}

impl BridgeError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::DuplicateHandler(_) => "duplicate_handler",
            Self::Channel { .. } => "channel",
            Self::Remote { .. } => "remote",
        }
    }

    /// The peer this error is local to, if any.
    pub fn peer(&self) -> Option<ContextId> {
        match self {
            Self::DuplicateHandler(_) => None,
            Self::Channel { peer, .. } | Self::Remote { peer, .. } => Some(*peer),
        }
    }
}
