//! Umbrella crate re-exporting the avrora stack.
//!
//! Most applications only need [`rpc`]: parse a [`Protocol`], register
//! handlers, and create emitters/listeners over any `AsyncRead + AsyncWrite`
//! transport. The lower layers are exposed for callers that want to reuse
//! the framing codec or the minimal type system on their own.

pub use avrora_codec as codec;
pub use avrora_rpc as rpc;
pub use avrora_schema as schema;
pub use avrora_wire as wire;

pub use avrora_rpc::{
    CallInfo, EmitterOptions, ListenerOptions, Protocol, ProtocolOptions, RpcError, SessionEvent,
    StatefulEmitter, StatefulListener, StatelessEmitter, StatelessListener, Value,
};
