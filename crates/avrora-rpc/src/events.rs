use avrora_wire::{HandshakeRequest, HandshakeResponse};

use crate::RpcError;

/// Events a session reports to its creator.
///
/// `EndOfTransmission` is emitted exactly once per session and is always the
/// last event; it carries the number of calls or handlers that were still
/// pending at teardown.
#[derive(Debug)]
pub enum SessionEvent {
    /// A handshake round was answered. `request` is `None` when the
    /// incoming handshake bytes could not be decoded (listener side).
    Handshake {
        request: Option<HandshakeRequest>,
        response: HandshakeResponse,
    },

    /// A session-level or per-message error that has no call to complete.
    Error(RpcError),

    /// Terminal event.
    EndOfTransmission { pending: usize },
}
