//! Avro RPC core.
//!
//! A [`Protocol`] describes a named set of typed messages. Sessions come in
//! two roles and two flavors each: emitters issue correlated requests
//! (stateful over one duplex stream, stateless over a channel factory), and
//! listeners accept the handshake, decode requests and dispatch them to
//! handlers registered on the protocol. See the crate-level integration
//! tests for end-to-end wiring.

mod emitter;
mod error;
mod events;
mod listener;
mod message;
mod protocol;
mod transport;

pub use emitter::*;
pub use error::*;
pub use events::*;
pub use listener::*;
pub use message::*;
pub use protocol::*;
pub use transport::*;

// The dynamic value type appears throughout the public API.
pub use avrora_schema::Value;
