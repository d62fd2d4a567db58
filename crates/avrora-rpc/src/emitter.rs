//! Client-side session state machines.
//!
//! [`StatefulEmitter`] owns one duplex transport for many correlated calls;
//! [`StatelessEmitter`] opens a fresh channel per call through a
//! [`ChannelFactory`] and embeds the handshake in the call's framed message.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use avrora_codec::{read_framed, write_framed, FrameError};
use avrora_schema::{cursor, unwrap_unions, Cursor, Fingerprint, Value};
use avrora_wire::{CallMetadata, HandshakeMatch, HandshakeRequest, HandshakeResponse};

use crate::protocol::{MessageCompat, ResolverSet};
use crate::{
    ChannelFactory, EmitterOptions, Message, Protocol, RpcError, SessionEvent, Transport,
};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct PendingCall {
    message: Arc<Message>,
    tx: oneshot::Sender<Result<Value, RpcError>>,
    started_at: Instant,
}

#[derive(Default)]
struct EmitterState {
    pending: HashMap<i64, PendingCall>,
    next_id: i64,
    server_hash: Option<Fingerprint>,
    resolvers: Option<Arc<ResolverSet>>,
    destroyed: bool,
}

/// A call in flight. Resolves to the decoded response, the peer's error, or
/// a local session error. One-way calls resolve immediately with
/// [`Value::Null`].
pub struct PendingResponse {
    id: i64,
    rx: Option<oneshot::Receiver<Result<Value, RpcError>>>,
}

impl PendingResponse {
    /// The correlation id assigned to this call.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_one_way(&self) -> bool {
        self.rx.is_none()
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().rx.as_mut() {
            None => Poll::Ready(Ok(Value::Null)),
            Some(rx) => Pin::new(rx).poll(cx).map(|r| match r {
                Ok(result) => result,
                Err(_) => Err(RpcError::Interrupted),
            }),
        }
    }
}

struct EmitterInner {
    protocol: Protocol,
    frame_size: usize,
    writer: tokio::sync::Mutex<BoxWriter>,
    state: Mutex<EmitterState>,
    ready: AtomicBool,
    hs_tx: mpsc::UnboundedSender<Option<Bytes>>,
    hs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Bytes>>>,
    drained: Notify,
    events: mpsc::UnboundedSender<SessionEvent>,
    eot: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Client-side session over a persistent duplex transport.
///
/// The handshake runs on first use (or via [`ready`](Self::ready)); calls
/// issued before it completes queue in emit order behind the writer lock.
pub struct StatefulEmitter {
    inner: Arc<EmitterInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl StatefulEmitter {
    pub(crate) fn create<T: Transport>(
        protocol: Protocol,
        transport: T,
        options: EmitterOptions,
    ) -> StatefulEmitter {
        let (read_half, write_half) = tokio::io::split(transport);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (hs_tx, hs_rx) = mpsc::unbounded_channel();
        let mut state = EmitterState::default();
        state.next_id = 1;
        let inner = Arc::new(EmitterInner {
            protocol,
            frame_size: options.frame_size,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            state: Mutex::new(state),
            ready: AtomicBool::new(false),
            hs_tx,
            hs_rx: tokio::sync::Mutex::new(hs_rx),
            drained: Notify::new(),
            events: event_tx,
            eot: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(Arc::clone(&inner), read_half));
        *inner.reader.lock() = Some(handle);
        StatefulEmitter {
            inner,
            events: Mutex::new(Some(event_rx)),
        }
    }

    /// Takes the session event stream. Can only be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Runs the handshake now instead of on the first call.
    pub async fn ready(&self) -> Result<(), RpcError> {
        let mut writer = self.inner.writer.lock().await;
        if self.inner.state.lock().destroyed {
            return Err(RpcError::Destroyed);
        }
        self.inner.ensure_ready(&mut writer).await
    }

    /// Issues a call and waits for its completion.
    pub async fn emit(&self, name: &str, request: Value) -> Result<Value, RpcError> {
        self.start_call(name, request).await?.await
    }

    /// Issues a call, returning the in-flight handle once the request is on
    /// the wire. Calls started before the handshake completes are written
    /// in start order once it does.
    pub async fn start_call(&self, name: &str, request: Value) -> Result<PendingResponse, RpcError> {
        let message = self
            .inner
            .protocol
            .message(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMessage(name.to_string()))?;
        // Encode up front so a bad request fails before touching the wire.
        let mut body = Vec::new();
        message.request().encode(&request, &mut body)?;

        let mut writer = self.inner.writer.lock().await;
        if self.inner.state.lock().destroyed {
            return Err(RpcError::Destroyed);
        }
        self.inner.ensure_ready(&mut writer).await?;

        {
            let state = self.inner.state.lock();
            if let Some(set) = &state.resolvers {
                match set.get(name) {
                    None => return Err(RpcError::MissingServerMessage(name.to_string())),
                    Some(MessageCompat::Incompatible(reason)) => {
                        return Err(RpcError::IncompatibleMessage {
                            name: name.to_string(),
                            reason: reason.clone(),
                        })
                    }
                    Some(MessageCompat::Compatible(_)) => {}
                }
            }
        }

        let (id, rx) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let rx = if message.is_one_way() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(
                    id,
                    PendingCall {
                        message: Arc::clone(&message),
                        tx,
                        started_at: Instant::now(),
                    },
                );
                Some(rx)
            };
            (id, rx)
        };

        let mut buf = Vec::with_capacity(body.len() + name.len() + 16);
        CallMetadata::new(id).encode(&mut buf);
        cursor::write_string(&mut buf, name);
        buf.extend_from_slice(&body);
        if let Err(e) = write_framed(&mut *writer, &buf, self.inner.frame_size).await {
            self.inner.state.lock().pending.remove(&id);
            return Err(RpcError::Frame(e));
        }
        trace!(id, msg = name, "request written");
        Ok(PendingResponse { id, rx })
    }

    /// Number of calls awaiting a response.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Tears the session down.
    ///
    /// With `no_wait` unset, stops accepting calls, waits until every
    /// pending call has completed, then ends the writable side. With
    /// `no_wait` set, fails every pending call with `interrupted` and ends
    /// the writable side immediately. Either way `EndOfTransmission` fires
    /// exactly once, carrying the number of calls that were cut off.
    pub async fn destroy(&self, no_wait: bool) -> Result<(), RpcError> {
        self.inner.state.lock().destroyed = true;
        if no_wait {
            let cut: Vec<PendingCall> = {
                let mut state = self.inner.state.lock();
                state.pending.drain().map(|(_, call)| call).collect()
            };
            let pending = cut.len();
            for call in cut {
                let _ = call.tx.send(Err(RpcError::Interrupted));
            }
            let _ = self.inner.hs_tx.send(None);
            if let Some(handle) = self.inner.reader.lock().take() {
                handle.abort();
            }
            self.inner.shutdown_writer().await;
            self.inner.finish(pending);
        } else {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.state.lock().pending.is_empty() {
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

impl Drop for StatefulEmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop<R>(inner: Arc<EmitterInner>, mut reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        match read_framed(&mut reader).await {
            Ok(Some(message)) => {
                if !inner.ready.load(Ordering::Acquire) {
                    let _ = inner.hs_tx.send(Some(message));
                } else {
                    inner.process_response(&message);
                }
            }
            Ok(None) => {
                inner.teardown(None);
                return;
            }
            Err(e) => {
                inner.teardown(Some(RpcError::Frame(e)));
                return;
            }
        }
    }
}

impl EmitterInner {
    async fn ensure_ready(&self, writer: &mut BoxWriter) -> Result<(), RpcError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.negotiate(writer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Handshake failures are fatal for the whole session.
                let detail = match &e {
                    RpcError::Handshake(inner) => inner.clone(),
                    other => other.to_string(),
                };
                self.teardown(Some(RpcError::Handshake(detail)));
                Err(e)
            }
        }
    }

    async fn negotiate(&self, writer: &mut BoxWriter) -> Result<(), RpcError> {
        let own = self.protocol.fingerprint();
        let mut server_hash = self.state.lock().server_hash.unwrap_or(own);
        let mut include_text = false;
        let mut hs_rx = self.hs_rx.lock().await;
        loop {
            let request = HandshakeRequest {
                client_hash: own.bytes(),
                client_protocol: include_text.then(|| self.protocol.document().to_string()),
                server_hash: server_hash.bytes(),
                meta: Vec::new(),
            };
            let mut buf = Vec::new();
            request.encode(&mut buf);
            write_framed(writer, &buf, self.frame_size)
                .await
                .map_err(RpcError::Frame)?;
            debug!(server = %server_hash, include_text, "handshake request sent");

            let message = match hs_rx.recv().await {
                Some(Some(message)) => message,
                _ => return Err(RpcError::Interrupted),
            };
            let mut cur = Cursor::new(&message);
            let response = HandshakeResponse::decode(&mut cur)
                .map_err(|e| RpcError::Handshake(format!("undecodable response: {e}")))?;

            if let Some(hash) = absorb_server_data(&self.protocol, &response)? {
                server_hash = hash;
            }

            match response.match_ {
                HandshakeMatch::Both | HandshakeMatch::Client => {
                    let resolvers = resolver_set_for(&self.protocol, server_hash)?;
                    {
                        let mut state = self.state.lock();
                        state.server_hash = Some(server_hash);
                        state.resolvers = resolvers;
                    }
                    self.ready.store(true, Ordering::Release);
                    debug!(matched = %response.match_, "handshake complete");
                    let _ = self.events.send(SessionEvent::Handshake {
                        request: Some(request),
                        response,
                    });
                    return Ok(());
                }
                HandshakeMatch::None => {
                    if let Some(error) = response.meta_error() {
                        return Err(RpcError::Handshake(error));
                    }
                    if include_text {
                        return Err(RpcError::Handshake(
                            "server rejected the handshake".to_string(),
                        ));
                    }
                    include_text = true;
                }
            }
        }
    }

    fn process_response(&self, message: &[u8]) {
        let mut cur = Cursor::new(message);
        let meta = match CallMetadata::decode(&mut cur) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "invalid metadata on response");
                let _ = self
                    .events
                    .send(SessionEvent::Error(RpcError::InvalidMetadata(e.to_string())));
                return;
            }
        };
        let call = self.state.lock().pending.remove(&meta.id);
        let Some(call) = call else {
            warn!(id = meta.id, "orphan response");
            let _ = self
                .events
                .send(SessionEvent::Error(RpcError::OrphanResponse(meta.id)));
            return;
        };
        let resolvers = self.state.lock().resolvers.clone();
        let result = decode_reply(
            &call.message,
            resolvers.as_deref(),
            &mut cur,
            self.protocol.options().wrap_unions,
        );
        trace!(
            id = meta.id,
            elapsed_us = call.started_at.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "call complete"
        );
        let _ = call.tx.send(result);
        if self.state.lock().pending.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Transport ended or the session failed; fail everything in flight.
    fn teardown(&self, error: Option<RpcError>) {
        let cut: Vec<PendingCall> = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        let pending = cut.len();
        for call in cut {
            let _ = call.tx.send(Err(RpcError::Interrupted));
        }
        let _ = self.hs_tx.send(None);
        // EndOfTransmission must stay the last event of the session.
        if let Some(e) = error {
            if !self.eot.load(Ordering::Acquire) {
                let _ = self.events.send(SessionEvent::Error(e));
            }
        }
        self.finish(pending);
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

/// Parses and caches the server protocol carried by a handshake response,
/// returning its fingerprint.
fn absorb_server_data(
    protocol: &Protocol,
    response: &HandshakeResponse,
) -> Result<Option<Fingerprint>, RpcError> {
    let (Some(hash), Some(text)) = (response.server_hash, response.server_protocol.as_deref())
    else {
        return Ok(None);
    };
    let remote_fp = Fingerprint::from_bytes(hash);
    if remote_fp != protocol.fingerprint() && protocol.emitter_cache_get(remote_fp).is_none() {
        let remote = Protocol::parse(text, *protocol.options())
            .map_err(|e| RpcError::Handshake(format!("bad server protocol: {e}")))?;
        let set = protocol.emitter_resolvers(&remote);
        protocol.emitter_cache_put(remote_fp, Arc::new(set));
    }
    Ok(Some(remote_fp))
}

/// Resolvers for a negotiated server hash; `None` when the peer runs our
/// own protocol.
fn resolver_set_for(
    protocol: &Protocol,
    server_hash: Fingerprint,
) -> Result<Option<Arc<ResolverSet>>, RpcError> {
    if server_hash == protocol.fingerprint() {
        Ok(None)
    } else {
        protocol
            .emitter_cache_get(server_hash)
            .map(Some)
            .ok_or_else(|| RpcError::Handshake("server protocol never provided".to_string()))
    }
}

/// Decodes a reply body (error flag, then response or error union) into the
/// call's completion value.
fn decode_reply(
    message: &Message,
    resolvers: Option<&ResolverSet>,
    cur: &mut Cursor<'_>,
    wrap_unions: bool,
) -> Result<Value, RpcError> {
    let per_message = match resolvers.map(|set| set.get(message.name())) {
        None => None,
        Some(Some(MessageCompat::Compatible(m))) => Some(m),
        Some(Some(MessageCompat::Incompatible(reason))) => {
            return Err(RpcError::IncompatibleMessage {
                name: message.name().to_string(),
                reason: reason.clone(),
            })
        }
        Some(None) => {
            return Err(RpcError::MissingServerMessage(message.name().to_string()))
        }
    };
    let is_error = cur
        .read_boolean()
        .map_err(|e| RpcError::TruncatedMessage(e.to_string()))?;
    if !is_error {
        let value = match per_message.and_then(|m| m.response.as_ref()) {
            Some(resolver) => resolver.decode(cur, wrap_unions),
            None => message.response().decode(cur, wrap_unions),
        }
        .map_err(|e| RpcError::TruncatedMessage(e.to_string()))?;
        return Ok(value);
    }
    // Decode the error union wrapped so the branch index is visible.
    let value = match per_message.and_then(|m| m.errors.as_ref()) {
        Some(resolver) => resolver.decode(cur, true),
        None => message.errors().decode(cur, true),
    }
    .map_err(|e| RpcError::TruncatedMessage(e.to_string()))?;
    match value {
        Value::Union(0, inner) => match *inner {
            Value::String(s) => Err(RpcError::Remote(s)),
            other => Err(RpcError::Application(other)),
        },
        Value::Union(index, inner) => {
            let delivered = if wrap_unions {
                Value::Union(index, inner)
            } else {
                unwrap_unions(*inner)
            };
            Err(RpcError::Application(delivered))
        }
        other => Err(RpcError::TruncatedMessage(format!(
            "unexpected error value {other:?}"
        ))),
    }
}

#[derive(Default)]
struct StatelessEmitterState {
    next_id: i64,
    in_flight: usize,
    destroyed: bool,
    server_hash: Option<Fingerprint>,
}

struct StatelessEmitterInner {
    protocol: Protocol,
    factory: Box<dyn ChannelFactory>,
    frame_size: usize,
    state: Mutex<StatelessEmitterState>,
    stop: Notify,
    drained: Notify,
    events: mpsc::UnboundedSender<SessionEvent>,
    eot: AtomicBool,
}

/// Client-side session acquiring one channel per call.
///
/// The handshake request travels in the same framed message as the call;
/// a `NONE` answer triggers one retry on a fresh channel with the protocol
/// text included. The negotiated server fingerprint is remembered across
/// calls, and resolver sets are shared through the protocol-level cache.
pub struct StatelessEmitter {
    inner: Arc<StatelessEmitterInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl StatelessEmitter {
    pub(crate) fn create(
        protocol: Protocol,
        factory: Box<dyn ChannelFactory>,
        options: EmitterOptions,
    ) -> StatelessEmitter {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut state = StatelessEmitterState::default();
        state.next_id = 1;
        StatelessEmitter {
            inner: Arc::new(StatelessEmitterInner {
                protocol,
                factory,
                frame_size: options.frame_size,
                state: Mutex::new(state),
                stop: Notify::new(),
                drained: Notify::new(),
                events: event_tx,
                eot: AtomicBool::new(false),
            }),
            events: Mutex::new(Some(event_rx)),
        }
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Issues a call over a fresh channel and waits for its completion.
    pub async fn emit(&self, name: &str, request: Value) -> Result<Value, RpcError> {
        let message = self
            .inner
            .protocol
            .message(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMessage(name.to_string()))?;
        let mut body = Vec::new();
        message.request().encode(&request, &mut body)?;
        let id = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(RpcError::Destroyed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.in_flight += 1;
            id
        };
        let result = self.inner.call(&message, id, &body).await;
        {
            let mut state = self.inner.state.lock();
            state.in_flight -= 1;
            if state.in_flight == 0 {
                self.inner.drained.notify_waiters();
            }
        }
        result
    }

    /// Tears the session down; see [`StatefulEmitter::destroy`].
    pub async fn destroy(&self, no_wait: bool) -> Result<(), RpcError> {
        let in_flight = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            state.in_flight
        };
        if no_wait {
            self.inner.stop.notify_waiters();
            self.inner.finish(in_flight);
        } else {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.state.lock().in_flight == 0 {
                    break;
                }
                notified.await;
            }
            self.inner.finish(0);
        }
        Ok(())
    }
}

impl StatelessEmitterInner {
    async fn call(&self, message: &Arc<Message>, id: i64, body: &[u8]) -> Result<Value, RpcError> {
        let own = self.protocol.fingerprint();
        let mut include_text = false;
        loop {
            // Open Question (b): factory failures before a channel exists
            // interrupt the call rather than getting a distinct class.
            let channel = self.factory.open().await.map_err(|e| {
                debug!(error = %e, "channel factory failed");
                RpcError::Interrupted
            })?;
            let (mut read_half, mut write_half) = tokio::io::split(channel);

            let server_hash = self.state.lock().server_hash.unwrap_or(own);
            let request = HandshakeRequest {
                client_hash: own.bytes(),
                client_protocol: include_text.then(|| self.protocol.document().to_string()),
                server_hash: server_hash.bytes(),
                meta: Vec::new(),
            };
            let mut buf = Vec::new();
            request.encode(&mut buf);
            CallMetadata::new(id).encode(&mut buf);
            cursor::write_string(&mut buf, message.name());
            buf.extend_from_slice(body);
            write_framed(&mut write_half, &buf, self.frame_size)
                .await
                .map_err(RpcError::Frame)?;
            trace!(id, msg = message.name(), include_text, "stateless request written");

            let reply = {
                let notified = self.stop.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.state.lock().destroyed {
                    return Err(RpcError::Interrupted);
                }
                tokio::select! {
                    read = read_framed(&mut read_half) => match read {
                        Ok(Some(reply)) => reply,
                        Ok(None) | Err(FrameError::UnexpectedEnd) => {
                            return Err(RpcError::NoMessageDecoded)
                        }
                        Err(e) => return Err(RpcError::Frame(e)),
                    },
                    _ = &mut notified => return Err(RpcError::Interrupted),
                }
            };

            let mut cur = Cursor::new(&reply);
            let response = HandshakeResponse::decode(&mut cur)
                .map_err(|e| RpcError::Handshake(format!("undecodable response: {e}")))?;
            let server_hash = match absorb_server_data(&self.protocol, &response)? {
                Some(hash) => {
                    self.state.lock().server_hash = Some(hash);
                    hash
                }
                None => server_hash,
            };

            match response.match_ {
                HandshakeMatch::Both | HandshakeMatch::Client => {
                    let resolvers = resolver_set_for(&self.protocol, server_hash)?;
                    let _ = self.events.send(SessionEvent::Handshake {
                        request: Some(request),
                        response,
                    });
                    if message.is_one_way() {
                        return Ok(Value::Null);
                    }
                    let meta = CallMetadata::decode(&mut cur)
                        .map_err(|e| RpcError::InvalidMetadata(e.to_string()))?;
                    if meta.id != id {
                        return Err(RpcError::OrphanResponse(meta.id));
                    }
                    return decode_reply(
                        message,
                        resolvers.as_deref(),
                        &mut cur,
                        self.protocol.options().wrap_unions,
                    );
                }
                HandshakeMatch::None => {
                    if let Some(error) = response.meta_error() {
                        return Err(RpcError::Handshake(error));
                    }
                    if include_text {
                        return Err(RpcError::Handshake(
                            "server rejected the handshake".to_string(),
                        ));
                    }
                    include_text = true;
                }
            }
        }
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
}
