use thiserror::Error;

/// Errors produced while parsing schemas, encoding or decoding values, or
/// resolving a writer schema against a reader schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema document itself is malformed.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A schema referenced a name that was never declared.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A required attribute is missing from a schema declaration.
    #[error("missing attribute {0:?}")]
    MissingAttribute(&'static str),

    /// A value does not conform to the schema it is encoded with.
    #[error("invalid {schema:?}: {reason}")]
    InvalidValue { schema: String, reason: String },

    /// The input ended before a complete value was decoded.
    #[error("truncated message")]
    Truncated,

    /// A writer schema cannot be resolved into a reader schema.
    #[error("cannot resolve writer {writer:?} into reader {reader:?}")]
    Incompatible { writer: String, reader: String },

    /// The underlying JSON document could not be parsed.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchemaError {
    pub(crate) fn invalid_value(schema: &crate::Schema, reason: impl Into<String>) -> Self {
        SchemaError::InvalidValue {
            schema: schema.type_name(),
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(writer: &crate::Schema, reader: &crate::Schema) -> Self {
        SchemaError::Incompatible {
            writer: writer.type_name(),
            reader: reader.type_name(),
        }
    }
}
