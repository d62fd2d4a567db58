//! Spec-level wire types for avrora.
//!
//! The handshake request/response records and the per-call metadata map are
//! fixed shapes from the Avro protocol specification, so they are encoded
//! and decoded directly against the byte cursor rather than through the
//! dynamic type system.

mod error;
mod handshake;
mod metadata;

pub use error::*;
pub use handshake::*;
pub use metadata::*;
