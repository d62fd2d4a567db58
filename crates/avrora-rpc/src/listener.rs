//! Server-side session state machines.
//!
//! [`StatefulListener`] accepts the handshake on a persistent duplex
//! transport and dispatches decoded requests to handlers registered on the
//! protocol, without blocking the read loop while a handler is outstanding.
//! [`StatelessListener`] serves exactly one request/response pair whose
//! handshake is embedded in the same framed message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use avrora_codec::{read_framed, write_framed};
use avrora_schema::{cursor, Cursor, Fingerprint, Value};
use avrora_wire::{
    CallMetadata, HandshakeMatch, HandshakeRequest, HandshakeResponse, META_ERROR_KEY,
};

use crate::protocol::{Handler, MessageCompat, ResolverSet};
use crate::{
    CallInfo, DynChannel, ListenerOptions, Message, Protocol, RpcError, SessionEvent, Transport,
};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct ListenerState {
    client_hash: Option<Fingerprint>,
    resolvers: Option<Arc<ResolverSet>>,
    ready: bool,
    outstanding: usize,
    destroyed: bool,
    /// When set, outstanding handlers complete but their replies are
    /// dropped instead of written.
    abandon: bool,
}

struct ListenerInner {
    protocol: Protocol,
    frame_size: usize,
    writer: tokio::sync::Mutex<BoxWriter>,
    state: Mutex<ListenerState>,
    drained: Notify,
    stop: Notify,
    events: mpsc::UnboundedSender<SessionEvent>,
    eot: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Server-side session over a persistent duplex transport.
pub struct StatefulListener {
    inner: Arc<ListenerInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl StatefulListener {
    pub(crate) fn create<T: Transport>(
        protocol: Protocol,
        transport: T,
        options: ListenerOptions,
    ) -> StatefulListener {
        let (read_half, write_half) = tokio::io::split(transport);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ListenerInner {
            protocol,
            frame_size: options.frame_size,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            state: Mutex::new(ListenerState::default()),
            drained: Notify::new(),
            stop: Notify::new(),
            events: event_tx,
            eot: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(Arc::clone(&inner), read_half));
        *inner.reader.lock() = Some(handle);
        StatefulListener {
            inner,
            events: Mutex::new(Some(event_rx)),
        }
    }

    /// Takes the session event stream. Can only be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Handlers currently running.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// The negotiated client fingerprint, once a handshake succeeded.
    pub fn client_fingerprint(&self) -> Option<Fingerprint> {
        self.inner.state.lock().client_hash
    }

    /// Tears the session down.
    ///
    /// With `no_wait` unset, stops reading, lets outstanding handlers
    /// complete and flush their replies, then ends the writable side. With
    /// `no_wait` set, outstanding handlers are abandoned: they still run to
    /// completion but their replies are dropped.
    pub async fn destroy(&self, no_wait: bool) -> Result<(), RpcError> {
        let outstanding = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            if no_wait {
                state.abandon = true;
            }
            state.outstanding
        };
        self.inner.stop.notify_waiters();
        if no_wait {
            if let Some(handle) = self.inner.reader.lock().take() {
                handle.abort();
            }
            self.inner.shutdown_writer().await;
            self.inner.finish(outstanding);
        } else {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.state.lock().outstanding == 0 {
                    break;
                }
                notified.await;
            }
            self.inner.shutdown_writer().await;
            self.inner.finish(0);
            if let Some(handle) = self.inner.reader.lock().take() {
                handle.abort();
            }
        }
        Ok(())
    }
}

impl Drop for StatefulListener {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop<R>(inner: Arc<ListenerInner>, mut reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let stopped = inner.stop.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        if inner.state.lock().destroyed {
            return;
        }
        let next = tokio::select! {
            read = read_framed(&mut reader) => read,
            _ = &mut stopped => return,
        };
        match next {
            Ok(Some(message)) => {
                let ready = inner.state.lock().ready;
                if !ready {
                    if inner.handle_handshake(&message).await.is_err() {
                        return;
                    }
                } else {
                    Arc::clone(&inner).handle_call(message).await;
                }
            }
            Ok(None) => {
                inner.transport_ended(None);
                return;
            }
            Err(e) => {
                inner.transport_ended(Some(RpcError::Frame(e)));
                return;
            }
        }
    }
}

/// Outcome of answering one handshake request.
struct Negotiation {
    response: HandshakeResponse,
    /// `Some` when the session becomes ready; the inner option is the
    /// resolver set (`None` when the client runs our own protocol).
    outcome: Option<Option<Arc<ResolverSet>>>,
}

/// Listener-side handshake decision, shared by both listener flavors.
fn negotiate(protocol: &Protocol, request: &HandshakeRequest) -> Negotiation {
    let own = protocol.fingerprint();
    let client_fp = Fingerprint::from_bytes(request.client_hash);

    if client_fp == own {
        let match_ = if request.server_hash == own.bytes() {
            HandshakeMatch::Both
        } else {
            HandshakeMatch::Client
        };
        let (server_protocol, server_hash) = if match_ == HandshakeMatch::Both {
            (None, None)
        } else {
            (Some(protocol.document().to_string()), Some(own.bytes()))
        };
        return Negotiation {
            response: HandshakeResponse {
                match_,
                server_protocol,
                server_hash,
                meta: Vec::new(),
            },
            outcome: Some(None),
        };
    }

    if let Some(set) = protocol.listener_cache_get(client_fp) {
        return Negotiation {
            response: HandshakeResponse {
                match_: HandshakeMatch::Client,
                server_protocol: Some(protocol.document().to_string()),
                server_hash: Some(own.bytes()),
                meta: Vec::new(),
            },
            outcome: Some(Some(set)),
        };
    }

    if let Some(text) = &request.client_protocol {
        let resolved = Protocol::parse(text, *protocol.options())
            .map_err(|e| RpcError::Handshake(format!("bad client protocol: {e}")))
            .and_then(|client| protocol.listener_resolvers(&client));
        match resolved {
            Ok(set) => {
                let set = Arc::new(set);
                protocol.listener_cache_put(client_fp, Arc::clone(&set));
                Negotiation {
                    response: HandshakeResponse {
                        match_: HandshakeMatch::Client,
                        server_protocol: Some(protocol.document().to_string()),
                        server_hash: Some(own.bytes()),
                        meta: Vec::new(),
                    },
                    outcome: Some(Some(set)),
                }
            }
            Err(e) => {
                let explanation = match &e {
                    RpcError::Handshake(inner) => inner.clone(),
                    other => other.to_string(),
                };
                debug!(error = %explanation, "rejecting client protocol");
                Negotiation {
                    response: HandshakeResponse {
                        match_: HandshakeMatch::None,
                        server_protocol: None,
                        server_hash: None,
                        meta: vec![(META_ERROR_KEY.to_string(), explanation.into_bytes())],
                    },
                    outcome: None,
                }
            }
        }
    } else {
        // Unknown client and no text: prompt a resend carrying it.
        Negotiation {
            response: HandshakeResponse {
                match_: HandshakeMatch::None,
                server_protocol: Some(protocol.document().to_string()),
                server_hash: Some(own.bytes()),
                meta: Vec::new(),
            },
            outcome: None,
        }
    }
}

impl ListenerInner {
    async fn handle_handshake(&self, message: &[u8]) -> Result<(), ()> {
        let mut cur = Cursor::new(message);
        let (request, negotiation) = match HandshakeRequest::decode(&mut cur) {
            Ok(request) => {
                let negotiation = negotiate(&self.protocol, &request);
                (Some(request), negotiation)
            }
            Err(e) => {
                debug!(error = %e, "undecodable handshake request");
                (
                    None,
                    Negotiation {
                        response: HandshakeResponse {
                            match_: HandshakeMatch::None,
                            server_protocol: None,
                            server_hash: None,
                            meta: Vec::new(),
                        },
                        outcome: None,
                    },
                )
            }
        };

        let matched = negotiation.response.match_;
        let mut buf = Vec::new();
        negotiation.response.encode(&mut buf);
        {
            let mut writer = self.writer.lock().await;
            if write_framed(&mut *writer, &buf, self.frame_size).await.is_err() {
                self.transport_ended(None);
                return Err(());
            }
        }
        if let Some(resolvers) = negotiation.outcome {
            let mut state = self.state.lock();
            state.ready = true;
            state.resolvers = resolvers;
            state.client_hash = request.as_ref().map(|r| Fingerprint::from_bytes(r.client_hash));
            debug!(matched = %matched, "handshake accepted");
        }
        let _ = self.events.send(SessionEvent::Handshake {
            request,
            response: negotiation.response,
        });
        Ok(())
    }

    async fn handle_call(self: Arc<Self>, message: Bytes) {
        let mut cur = Cursor::new(&message);
        let meta = match CallMetadata::decode(&mut cur) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "invalid metadata on request");
                let _ = self
                    .events
                    .send(SessionEvent::Error(RpcError::InvalidMetadata(e.to_string())));
                return;
            }
        };
        let name = match cur.read_string() {
            Ok(name) => name,
            Err(e) => {
                self.write_system_error(&meta, &format!("invalid request: {e}"))
                    .await;
                return;
            }
        };
        let Some(message_def) = self.protocol.message(&name).cloned() else {
            debug!(%name, "unknown message");
            self.write_system_error(&meta, &format!("unknown message: {name}"))
                .await;
            return;
        };

        let resolvers = self.state.lock().resolvers.clone();
        let request_resolver = match resolvers.as_deref().map(|set| set.get(&name)) {
            Some(Some(MessageCompat::Compatible(m))) => m.request.as_ref(),
            // Not negotiated for this message: fall back to our own schema.
            _ => None,
        };
        let wrap = self.protocol.options().wrap_unions;
        let request = match request_resolver {
            Some(resolver) => resolver.decode(&mut cur, wrap),
            None => message_def.request().decode(&mut cur, wrap),
        };
        let request = match request {
            Ok(value) => value,
            Err(e) => {
                if message_def.is_one_way() {
                    let _ = self
                        .events
                        .send(SessionEvent::Error(RpcError::InvalidRequest(e.to_string())));
                } else {
                    self.write_system_error(&meta, &format!("invalid request: {e}"))
                        .await;
                }
                return;
            }
        };

        let info = CallInfo {
            message: name.clone(),
            id: meta.id,
        };
        trace!(id = meta.id, msg = %name, "dispatching");
        match (self.protocol.handler(&name), message_def.is_one_way()) {
            (Some(Handler::TwoWay(handler)), false) => {
                self.begin_handler();
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    let outcome =
                        std::panic::AssertUnwindSafe(handler(request, info)).catch_unwind().await;
                    let reply = match outcome {
                        Ok(result) => encode_reply(
                            inner.protocol.options().strict_errors,
                            &meta,
                            &message_def,
                            result,
                        ),
                        Err(_) => {
                            warn!(id = meta.id, "handler panicked");
                            encode_system_error(&meta, "internal server error")
                        }
                    };
                    inner.write_message(reply).await;
                    inner.end_handler();
                });
            }
            (Some(Handler::OneWay(handler)), true) => {
                self.begin_handler();
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    handler(request, info);
                    inner.end_handler();
                });
            }
            (None, false) | (Some(_), false) => {
                self.write_system_error(&meta, &format!("unhandled message: {name}"))
                    .await;
            }
            (_, true) => {
                let _ = self
                    .events
                    .send(SessionEvent::Error(RpcError::UnhandledMessage(name)));
            }
        }
    }

    async fn write_system_error(&self, meta: &CallMetadata, text: &str) {
        let buf = encode_system_error(meta, text);
        self.write_message(buf).await;
    }

    async fn write_message(&self, buf: Vec<u8>) {
        if self.state.lock().abandon {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_framed(&mut *writer, &buf, self.frame_size).await {
            debug!(error = %e, "failed to write reply");
        }
    }

    fn begin_handler(&self) {
        self.state.lock().outstanding += 1;
    }

    fn end_handler(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            state.outstanding == 0
        };
        if idle {
            self.drained.notify_waiters();
        }
    }

    /// The readable side ended: abandon outstanding work, as if
    /// `destroy(no_wait = true)` had been observed locally.
    fn transport_ended(&self, error: Option<RpcError>) {
        let outstanding = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.abandon = true;
            state.outstanding
        };
        // EndOfTransmission must stay the last event of the session.
        if let Some(e) = error {
            if !self.eot.load(Ordering::Acquire) {
                let _ = self.events.send(SessionEvent::Error(e));
            }
        }
        self.finish(outstanding);
        self.drained.notify_waiters();
    }

    fn finish(&self, pending: usize) {
        if self
            .eot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(pending, "end of transmission");
            let _ = self
                .events
                .send(SessionEvent::EndOfTransmission { pending });
        }
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Builds the wire body of a system error reply: the string branch of the
/// error union.
fn encode_system_error(meta: &CallMetadata, text: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    meta.encode(&mut buf);
    cursor::write_boolean(&mut buf, true);
    cursor::write_long(&mut buf, 0);
    cursor::write_string(&mut buf, text);
    buf
}

/// Encodes a reply frame body: metadata echo, error flag, payload.
///
/// Handler errors are matched against the declared union: bare strings ride
/// the system branch, other bare values get a branch inferred. Values that
/// fit no branch become system errors, either strictly labelled or
/// stringified depending on `strict_errors`.
fn encode_reply(
    strict_errors: bool,
    meta: &CallMetadata,
    message: &Message,
    result: Result<Value, Value>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    meta.encode(&mut buf);
    match result {
        Ok(value) => {
            let mut body = Vec::new();
            match message.response().encode(&value, &mut body) {
                Ok(()) => {
                    cursor::write_boolean(&mut buf, false);
                    buf.extend_from_slice(&body);
                    buf
                }
                Err(e) => encode_system_error(meta, &format!("invalid response: {e}")),
            }
        }
        Err(error_value) => {
            let errors = message.errors();
            let candidate = match error_value.clone() {
                wrapped @ Value::Union(..) => Some(wrapped),
                Value::String(s) => Some(Value::Union(0, Box::new(Value::String(s)))),
                bare => errors
                    .union_branch_for(&bare)
                    .map(|index| Value::Union(index, Box::new(bare))),
            };
            let candidate = candidate.filter(|c| errors.is_valid(c));
            match candidate {
                Some(c) => {
                    let mut body = Vec::new();
                    match errors.encode(&c, &mut body) {
                        Ok(()) => {
                            cursor::write_boolean(&mut buf, true);
                            buf.extend_from_slice(&body);
                            buf
                        }
                        Err(e) => encode_system_error(meta, &format!("invalid error: {e}")),
                    }
                }
                None if strict_errors => encode_system_error(
                    meta,
                    "error value does not match the declared error union",
                ),
                None => encode_system_error(meta, &format!("{error_value:?}")),
            }
        }
    }
}

/// Server side of a one-shot channel: one handshake, at most one call.
pub struct StatelessListener {
    protocol: Protocol,
    channel: Box<dyn DynChannel>,
    frame_size: usize,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl StatelessListener {
    pub(crate) fn create(
        protocol: Protocol,
        channel: Box<dyn DynChannel>,
        options: ListenerOptions,
    ) -> StatelessListener {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        StatelessListener {
            protocol,
            channel,
            frame_size: options.frame_size,
            events: Mutex::new(Some(event_rx)),
            event_tx,
        }
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Serves the channel: reads one framed message holding the handshake
    /// request and, when matched, the call; writes back one framed message
    /// holding the handshake response and, when a call arrived, its reply.
    pub async fn run(self) -> Result<(), RpcError> {
        let StatelessListener {
            protocol,
            channel,
            frame_size,
            event_tx,
            ..
        } = self;
        let (mut reader, mut writer) = tokio::io::split(channel);
        let Some(message) = read_framed(&mut reader).await? else {
            Self::finish(&event_tx);
            return Ok(());
        };
        let mut cur = Cursor::new(&message);
        let (request, negotiation) = match HandshakeRequest::decode(&mut cur) {
            Ok(request) => {
                let negotiation = negotiate(&protocol, &request);
                (Some(request), negotiation)
            }
            Err(e) => {
                debug!(error = %e, "undecodable handshake request");
                (
                    None,
                    Negotiation {
                        response: HandshakeResponse {
                            match_: HandshakeMatch::None,
                            server_protocol: None,
                            server_hash: None,
                            meta: Vec::new(),
                        },
                        outcome: None,
                    },
                )
            }
        };

        let mut out = Vec::new();
        negotiation.response.encode(&mut out);
        if let Some(resolvers) = &negotiation.outcome {
            if !cur.is_empty() {
                Self::process_call(&protocol, &event_tx, resolvers.as_deref(), &mut cur, &mut out)
                    .await;
            }
        }
        let _ = event_tx.send(SessionEvent::Handshake {
            request,
            response: negotiation.response,
        });

        write_framed(&mut writer, &out, frame_size)
            .await
            .map_err(RpcError::Frame)?;
        let _ = writer.shutdown().await;
        Self::finish(&event_tx);
        Ok(())
    }

    /// Decodes and dispatches the call embedded after the handshake,
    /// appending the reply to `out`. Two-way handlers run inline.
    async fn process_call(
        protocol: &Protocol,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
        resolvers: Option<&ResolverSet>,
        cur: &mut Cursor<'_>,
        out: &mut Vec<u8>,
    ) {
        let meta = match CallMetadata::decode(cur) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "invalid metadata on request");
                let _ =
                    event_tx.send(SessionEvent::Error(RpcError::InvalidMetadata(e.to_string())));
                return;
            }
        };
        let name = match cur.read_string() {
            Ok(name) => name,
            Err(e) => {
                out.extend_from_slice(&encode_system_error(&meta, &format!("invalid request: {e}")));
                return;
            }
        };
        let Some(message_def) = protocol.message(&name).cloned() else {
            out.extend_from_slice(&encode_system_error(
                &meta,
                &format!("unknown message: {name}"),
            ));
            return;
        };
        let request_resolver = match resolvers.map(|set| set.get(&name)) {
            Some(Some(MessageCompat::Compatible(m))) => m.request.as_ref(),
            _ => None,
        };
        let wrap = protocol.options().wrap_unions;
        let request = match request_resolver {
            Some(resolver) => resolver.decode(cur, wrap),
            None => message_def.request().decode(cur, wrap),
        };
        let request = match request {
            Ok(value) => value,
            Err(e) => {
                if !message_def.is_one_way() {
                    out.extend_from_slice(&encode_system_error(
                        &meta,
                        &format!("invalid request: {e}"),
                    ));
                }
                return;
            }
        };
        let info = CallInfo {
            message: name.clone(),
            id: meta.id,
        };
        match (protocol.handler(&name), message_def.is_one_way()) {
            (Some(Handler::TwoWay(handler)), false) => {
                let outcome =
                    std::panic::AssertUnwindSafe(handler(request, info)).catch_unwind().await;
                let reply = match outcome {
                    Ok(result) => encode_reply(
                        protocol.options().strict_errors,
                        &meta,
                        &message_def,
                        result,
                    ),
                    Err(_) => {
                        warn!(id = meta.id, "handler panicked");
                        encode_system_error(&meta, "internal server error")
                    }
                };
                out.extend_from_slice(&reply);
            }
            (Some(Handler::OneWay(handler)), true) => {
                handler(request, info);
            }
            (_, false) => {
                out.extend_from_slice(&encode_system_error(
                    &meta,
                    &format!("unhandled message: {name}"),
                ));
            }
            (_, true) => {
                let _ = event_tx.send(SessionEvent::Error(RpcError::UnhandledMessage(name)));
            }
        }
    }

    fn finish(event_tx: &mpsc::UnboundedSender<SessionEvent>) {
        let _ = event_tx.send(SessionEvent::EndOfTransmission { pending: 0 });
    }
}
