//! Errors shared across the connector/router/interface layers.

use crate::codec::{DeserializationError, SerializationError};
use crate::pipe::TransportError;

/// Failure surfaced by the bindings layers.
///
/// Codec and transport failures are wrapped transparently; the remaining
/// variants are illegal-state conditions reported at the call site rather
/// than swallowed.
#[derive(Debug, thiserror::Error)]
pub enum BindingsError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("router is closed")]
    RouterClosed,

    #[error("request id {0} is already in flight")]
    DuplicateRequestId(u64),

    #[error("call message must use the expecting-response header shape")]
    NotACall,

    #[error("received a call this endpoint cannot answer (message type {0})")]
    UnexpectedCall(u32),

    #[error("response message type {got} does not match call type {want}")]
    ResponseTypeMismatch { want: u32, got: u32 },

    #[error("handle is invalid")]
    InvalidHandle,
}
