//! Minimal Avro type system consumed by the avrora RPC runtime.
//!
//! This crate provides exactly the surface the RPC core needs: parsed
//! [`Schema`]s, dynamically typed [`Value`]s with binary encode/decode, a
//! byte-level [`Cursor`] over Avro primitives, writer-to-reader
//! [`Resolver`]s, and MD5 [`Fingerprint`]s over canonical JSON. Logical
//! types and recursive schemas are out of scope.

pub mod cursor;
mod error;
mod fingerprint;
mod resolver;
mod schema;
mod value;

pub use cursor::Cursor;
pub use error::*;
pub use fingerprint::*;
pub use resolver::*;
pub use schema::*;
pub use value::*;
