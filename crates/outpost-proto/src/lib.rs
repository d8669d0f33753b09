//! Outpost wire protocol.
//!
//! Tunnel frames exchanged between edge agents and the relay, their
//! length-delimited codec, the stream multiplexer both ends share, and the
//! edge key agents bootstrap from.

pub mod codec;
pub mod edgekey;
pub mod stream;
pub mod v1;

pub use codec::{CodecError, FrameCodec};
pub use edgekey::{EdgeKey, EdgeKeyError};
pub use stream::{Delivery, StreamMux};
pub use v1::*;
