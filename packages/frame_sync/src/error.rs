use frame_rpc::{BridgeError, DiscoveryError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("frame sync is already connected")]
    AlreadyConnected,

    /// A disconnected FrameSync cannot be reused; create a new one.
    #[error("frame sync has been disconnected")]
    Closed,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyConnected => "already_connected",
            Self::Closed => "closed",
            Self::Discovery(_) => "discovery",
            Self::Bridge(e) => e.error_code(),
        }
    }
}
