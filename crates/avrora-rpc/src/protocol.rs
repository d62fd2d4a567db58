//! The protocol object: named messages, fingerprint, resolver caches and
//! handler registrations.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as Json};

use avrora_codec::DEFAULT_FRAME_SIZE;
use avrora_schema::{Fingerprint, Resolver, Schema, Value};

use crate::{
    Message, RpcError, StatefulEmitter, StatefulListener, StatelessEmitter, StatelessListener,
    Transport,
};

/// Options shared by a protocol and every session derived from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolOptions {
    /// Decode union values as [`Value::Union`] so the branch index is
    /// visible to the application.
    pub wrap_unions: bool,
    /// Reject handler error values that do not match the declared error
    /// union instead of stringifying them.
    pub strict_errors: bool,
}

/// Context handed to a handler along with the decoded request.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Name of the message being handled.
    pub message: String,
    /// Correlation id of the call.
    pub id: i64,
}

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send>>;

#[derive(Clone)]
pub(crate) enum Handler {
    TwoWay(Arc<dyn Fn(Value, CallInfo) -> HandlerFuture + Send + Sync>),
    OneWay(Arc<dyn Fn(Value, CallInfo) + Send + Sync>),
}

/// Per-peer resolver state for one message.
#[derive(Debug)]
pub(crate) struct MessageResolvers {
    /// Listener role: decodes peer-written requests. `None` when the
    /// schemas are identical.
    pub request: Option<Resolver>,
    /// Emitter role: decodes peer-written responses.
    pub response: Option<Resolver>,
    /// Emitter role: decodes peer-written error unions.
    pub errors: Option<Resolver>,
}

/// Compatibility verdict for one shared message.
#[derive(Debug)]
pub(crate) enum MessageCompat {
    Compatible(MessageResolvers),
    /// The peer declares the message but schemas do not resolve; surfaced
    /// on the first affected call.
    Incompatible(String),
}

/// Negotiated per-message resolvers for one peer fingerprint.
#[derive(Default, Debug)]
pub(crate) struct ResolverSet {
    by_message: HashMap<String, MessageCompat>,
}

impl ResolverSet {
    pub(crate) fn get(&self, name: &str) -> Option<&MessageCompat> {
        self.by_message.get(name)
    }
}

struct ProtocolShared {
    name: String,
    document: String,
    fingerprint: Fingerprint,
    types: Vec<Arc<Schema>>,
    messages: Vec<Arc<Message>>,
    index: HashMap<String, usize>,
    options: ProtocolOptions,
    /// Peer fingerprint -> resolvers for decoding that peer's responses.
    emitter_cache: RwLock<HashMap<Fingerprint, Arc<ResolverSet>>>,
    /// Peer fingerprint -> resolvers for decoding that peer's requests.
    listener_cache: RwLock<HashMap<Fingerprint, Arc<ResolverSet>>>,
}

/// An in-memory protocol description.
///
/// Cloning yields another handle to the same protocol. [`subprotocol`]
/// creates a façade that shares the fingerprint and resolver caches but has
/// its own handler registrations.
///
/// [`subprotocol`]: Protocol::subprotocol
#[derive(Clone)]
pub struct Protocol {
    shared: Arc<ProtocolShared>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
}

impl Protocol {
    /// Parses a protocol document (the standard Avro JSON form).
    pub fn parse(doc: &str, options: ProtocolOptions) -> Result<Protocol, RpcError> {
        let json: Json =
            serde_json::from_str(doc).map_err(|e| RpcError::InvalidProtocol(e.to_string()))?;
        let obj = json
            .as_object()
            .ok_or_else(|| RpcError::InvalidProtocol("not a JSON object".to_string()))?;

        let raw_name = obj
            .get("protocol")
            .and_then(Json::as_str)
            .ok_or_else(|| RpcError::InvalidProtocol("missing protocol name".to_string()))?;
        if raw_name.is_empty() {
            return Err(RpcError::InvalidProtocol("empty protocol name".to_string()));
        }
        let namespace = obj.get("namespace").and_then(Json::as_str);
        let name = if raw_name.contains('.') {
            raw_name.to_string()
        } else {
            match namespace {
                Some(ns) if !ns.is_empty() => format!("{ns}.{raw_name}"),
                _ => raw_name.to_string(),
            }
        };

        let mut names = HashMap::new();
        let mut types = Vec::new();
        if let Some(declared) = obj.get("types").and_then(Json::as_array) {
            for t in declared {
                types.push(Schema::parse(t, &mut names, namespace)?);
            }
        }

        let mut messages: Vec<Arc<Message>> = Vec::new();
        let mut index = HashMap::new();
        if let Some(declared) = obj.get("messages").and_then(Json::as_object) {
            for (message_name, message_json) in declared {
                let message = Message::parse(message_name, message_json, &mut names, namespace)?;
                index.insert(message_name.clone(), messages.len());
                messages.push(message);
            }
        }

        // Canonical text doubles as the handshake protocol text; the
        // fingerprint must be pure over it.
        let mut seen = HashSet::new();
        let mut canonical = Map::new();
        canonical.insert("protocol".to_string(), Json::String(name.clone()));
        if !types.is_empty() {
            canonical.insert(
                "types".to_string(),
                Json::Array(types.iter().map(|t| t.canonical_json(&mut seen)).collect()),
            );
        }
        if !messages.is_empty() {
            canonical.insert(
                "messages".to_string(),
                Json::Object(
                    messages
                        .iter()
                        .map(|m| (m.name().to_string(), m.canonical_json(&mut seen)))
                        .collect(),
                ),
            );
        }
        let document = Json::Object(canonical).to_string();
        let fingerprint = Fingerprint::of(document.as_bytes());

        Ok(Protocol {
            shared: Arc::new(ProtocolShared {
                name,
                document,
                fingerprint,
                types,
                messages,
                index,
                options,
                emitter_cache: RwLock::new(HashMap::new()),
                listener_cache: RwLock::new(HashMap::new()),
            }),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Fully qualified protocol name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Canonical protocol text, as exchanged during handshakes.
    pub fn document(&self) -> &str {
        &self.shared.document
    }

    /// MD5 fingerprint of the canonical text.
    pub fn fingerprint(&self) -> Fingerprint {
        self.shared.fingerprint
    }

    pub fn types(&self) -> &[Arc<Schema>] {
        &self.shared.types
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        &self.shared.messages
    }

    pub fn message(&self, name: &str) -> Option<&Arc<Message>> {
        self.shared
            .index
            .get(name)
            .map(|i| &self.shared.messages[*i])
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.shared.options
    }

    /// A façade sharing this protocol's identity and resolver caches but
    /// carrying its own handler registrations.
    pub fn subprotocol(&self) -> Protocol {
        Protocol {
            shared: Arc::clone(&self.shared),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a handler for a two-way message.
    pub fn on<F, Fut>(&self, name: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(Value, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let message = self
            .message(name)
            .ok_or_else(|| RpcError::UnknownMessage(name.to_string()))?;
        if message.is_one_way() {
            return Err(RpcError::InvalidProtocol(format!(
                "message {name} is one-way"
            )));
        }
        let boxed =
            Handler::TwoWay(Arc::new(move |v, i| Box::pin(handler(v, i)) as HandlerFuture));
        self.handlers.lock().insert(name.to_string(), boxed);
        Ok(())
    }

    /// Registers a handler for a one-way message.
    pub fn on_oneway<F>(&self, name: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(Value, CallInfo) + Send + Sync + 'static,
    {
        let message = self
            .message(name)
            .ok_or_else(|| RpcError::UnknownMessage(name.to_string()))?;
        if !message.is_one_way() {
            return Err(RpcError::InvalidProtocol(format!(
                "message {name} is two-way"
            )));
        }
        self.handlers
            .lock()
            .insert(name.to_string(), Handler::OneWay(Arc::new(handler)));
        Ok(())
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers.lock().get(name).cloned()
    }

    /// Builds emitter-role resolvers against a server protocol: for every
    /// shared message, resolvers that decode the server's responses and
    /// errors into local shapes. Local messages the server lacks are left
    /// out and fail on their first emit.
    pub(crate) fn emitter_resolvers(&self, server: &Protocol) -> ResolverSet {
        let mut set = ResolverSet::default();
        for local in self.messages() {
            let Some(remote) = server.message(local.name()) else {
                continue;
            };
            let compat = build_emitter_resolvers(local, remote);
            set.by_message.insert(local.name().to_string(), compat);
        }
        set
    }

    /// Builds listener-role resolvers against a client protocol, failing on
    /// the first incompatibility so the handshake can answer `NONE` with an
    /// explanation.
    pub(crate) fn listener_resolvers(&self, client: &Protocol) -> Result<ResolverSet, RpcError> {
        let mut set = ResolverSet::default();
        for remote in client.messages() {
            let name = remote.name();
            let local = self
                .message(name)
                .ok_or_else(|| RpcError::Handshake(format!("missing server message: {name}")))?;
            if local.is_one_way() != remote.is_one_way() {
                return Err(RpcError::Handshake(format!(
                    "one-way mismatch for message {name}"
                )));
            }
            let request = if remote.request() == local.request() {
                None
            } else {
                Some(
                    Resolver::new(Arc::clone(remote.request()), Arc::clone(local.request()))
                        .map_err(|e| {
                            RpcError::Handshake(format!("incompatible request for {name}: {e}"))
                        })?,
                )
            };
            if !local.is_one_way() && remote.response() != local.response() {
                // The client must be able to decode our responses.
                Resolver::new(Arc::clone(local.response()), Arc::clone(remote.response()))
                    .map_err(|e| {
                        RpcError::Handshake(format!("unresolvable response for {name}: {e}"))
                    })?;
            }
            set.by_message.insert(
                name.to_string(),
                MessageCompat::Compatible(MessageResolvers {
                    request,
                    response: None,
                    errors: None,
                }),
            );
        }
        Ok(set)
    }

    pub(crate) fn emitter_cache_get(&self, peer: Fingerprint) -> Option<Arc<ResolverSet>> {
        self.shared.emitter_cache.read().get(&peer).cloned()
    }

    pub(crate) fn emitter_cache_put(&self, peer: Fingerprint, set: Arc<ResolverSet>) {
        self.shared.emitter_cache.write().insert(peer, set);
    }

    pub(crate) fn listener_cache_get(&self, peer: Fingerprint) -> Option<Arc<ResolverSet>> {
        self.shared.listener_cache.read().get(&peer).cloned()
    }

    pub(crate) fn listener_cache_put(&self, peer: Fingerprint, set: Arc<ResolverSet>) {
        self.shared.listener_cache.write().insert(peer, set);
    }

    /// Creates a stateful emitter over a persistent duplex transport.
    pub fn create_emitter<T: Transport>(
        &self,
        transport: T,
        options: EmitterOptions,
    ) -> StatefulEmitter {
        StatefulEmitter::create(self.clone(), transport, options)
    }

    /// Creates a stateless emitter that opens one channel per call.
    pub fn create_stateless_emitter<F: crate::ChannelFactory>(
        &self,
        factory: F,
        options: EmitterOptions,
    ) -> StatelessEmitter {
        StatelessEmitter::create(self.clone(), Box::new(factory), options)
    }

    /// Creates a stateful listener over a persistent duplex transport.
    pub fn create_listener<T: Transport>(
        &self,
        transport: T,
        options: ListenerOptions,
    ) -> StatefulListener {
        StatefulListener::create(self.clone(), transport, options)
    }

    /// Creates a one-shot listener for a single request/response channel.
    pub fn create_stateless_listener<T: Transport>(
        &self,
        transport: T,
        options: ListenerOptions,
    ) -> StatelessListener {
        StatelessListener::create(self.clone(), Box::new(transport), options)
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.shared.name)
            .field("fingerprint", &self.shared.fingerprint)
            .field("messages", &self.shared.messages.len())
            .finish()
    }
}

fn build_emitter_resolvers(local: &Message, remote: &Message) -> MessageCompat {
    if local.is_one_way() != remote.is_one_way() {
        return MessageCompat::Incompatible(format!(
            "one-way mismatch for message {}",
            local.name()
        ));
    }
    let response = if local.is_one_way() || remote.response() == local.response() {
        None
    } else {
        match Resolver::new(Arc::clone(remote.response()), Arc::clone(local.response())) {
            Ok(r) => Some(r),
            Err(e) => return MessageCompat::Incompatible(e.to_string()),
        }
    };
    let errors = if remote.errors() == local.errors() {
        None
    } else {
        match Resolver::new(Arc::clone(remote.errors()), Arc::clone(local.errors())) {
            Ok(r) => Some(r),
            Err(e) => return MessageCompat::Incompatible(e.to_string()),
        }
    };
    MessageCompat::Compatible(MessageResolvers {
        request: None,
        response,
        errors,
    })
}

/// Session options for emitters.
#[derive(Debug, Clone, Copy)]
pub struct EmitterOptions {
    pub frame_size: usize,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

/// Session options for listeners.
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub frame_size: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}
