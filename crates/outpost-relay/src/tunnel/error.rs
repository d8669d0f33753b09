//! Tunnel server errors.

use outpost_proto::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Unknown endpoint or wrong credentials; deliberately indistinguishable.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Tunnel capacity exceeded ({max} active)")]
    CapacityExceeded { max: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(#[from] outpost_core::db::DatabaseError),

    #[error("Not found: {0}")]
    NotFound(String),
}
