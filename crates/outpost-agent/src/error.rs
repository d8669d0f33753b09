//! Agent error types.

use outpost_proto::{CodecError, EdgeKeyError, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    Connection(String),

    /// The relay answered with an error frame.
    #[error("Rejected by relay ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    EdgeKey(#[from] EdgeKeyError),
}
