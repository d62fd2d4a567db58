use avrora_schema::SchemaError;
use thiserror::Error;

/// Errors raised while decoding wire-level structures.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}
