use thiserror::Error;

use cairn_crypto::TransformError;
use cairn_protocol::ProtocolError;
use cairn_store::StoreError;
use cairn_types::Status;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed")]
    Closed,

    #[error("peer disconnected")]
    Disconnected,

    #[error("transaction timed out")]
    Timeout,

    #[error("no peer available for {0}")]
    NoRoute(String),

    #[error("storage root is not configured")]
    NoStorage,

    #[error("not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("remote returned {0}")]
    Remote(Status),

    #[error("node is shutting down")]
    Shutdown,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Error for a non-OK status received in a reply.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::ETIMEDOUT => Self::Timeout,
            Status::ECONNRESET => Self::Closed,
            other => Self::Remote(other),
        }
    }

    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Config(_) | Self::InvalidRequest(_) | Self::NoStorage => Status::EINVAL,
            Self::Closed | Self::Disconnected | Self::Shutdown => Status::ECONNRESET,
            Self::Timeout => Status::ETIMEDOUT,
            Self::NoRoute(_) => Status::ENOENT,
            Self::Unsupported(_) => Status::ENOTSUP,
            Self::Handshake(_) => Status::EPROTO,
            Self::Remote(status) => *status,
            Self::Protocol(e) => e.status(),
            Self::Store(e) => e.status(),
            Self::Transform(e) => e.status(),
            Self::Io(e) => Status::from_io(e),
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
