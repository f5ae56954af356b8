//! Error types for the replication manager.

use thiserror::Error;

/// Result type alias using [`McError`].
pub type Result<T> = std::result::Result<T, McError>;

/// Status returned by every fallible multicast-manager operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum McError {
    /// Bad handle, out-of-range id or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is already associated or already present.
    #[error("object already exists")]
    AlreadyExists,

    /// The object or association does not exist.
    #[error("object not found")]
    NotFound,

    /// No RDM block, node id or hardware id is available.
    #[error("replication resources exhausted")]
    ResourceExhausted,

    /// Destroy attempted while a hardware placement is still live.
    #[error("object still in use")]
    InUse,

    /// Internal model corruption; never a caller error.
    #[error("unexpected internal state: {0}")]
    Unexpected(String),

    /// The session/DMA transport rejected a write list.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl McError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        McError::InvalidArgument(msg.into())
    }

    pub(crate) fn unexpected(msg: impl Into<String>) -> Self {
        McError::Unexpected(msg.into())
    }
}
