use avrora_codec::FrameError;
use avrora_schema::{SchemaError, Value};
use thiserror::Error;

/// Errors surfaced by sessions and calls.
///
/// Frame and handshake errors are fatal for the session that saw them; the
/// other variants complete only the affected call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The protocol document could not be turned into a [`crate::Protocol`].
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// The emitted message name is not declared by the owning protocol.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// The listener has no handler registered for the message.
    #[error("unhandled message: {0}")]
    UnhandledMessage(String),

    /// The negotiated server protocol does not declare this message.
    #[error("missing server message: {0}")]
    MissingServerMessage(String),

    /// The peer declares the message but its schemas do not resolve.
    #[error("incompatible {name}: {reason}")]
    IncompatibleMessage { name: String, reason: String },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A reply arrived but its payload could not be fully decoded.
    #[error("truncated message: {0}")]
    TruncatedMessage(String),

    /// A stateless channel ended before a complete framed response arrived.
    #[error("no message decoded")]
    NoMessageDecoded,

    /// A reply carried a correlation id with no pending call.
    #[error("orphan response: {0}")]
    OrphanResponse(i64),

    /// The session was torn down while the call was outstanding.
    #[error("interrupted")]
    Interrupted,

    /// The session no longer accepts calls.
    #[error("destroyed")]
    Destroyed,

    #[error("handshake error: {0}")]
    Handshake(String),

    /// The peer reported a system error (the string branch of the error
    /// union).
    #[error("{0}")]
    Remote(String),

    /// The peer returned a declared error-union value.
    #[error("application error: {0:?}")]
    Application(Value),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}
