//! Sessions: the protocol state of one logical client connection.
//!
//! A [`Session`] decodes JSON-RPC messages in the order a transport hands
//! them over, answers lifecycle and discovery requests inline, and spawns one
//! task per capability invocation. Every message the session wants to send
//! goes through a bounded channel of [`Envelope`]s that the transport drains.
//!
//! # States
//!
//! ```text
//! Open --drain()--> Draining --(idle or grace elapsed)--> Closed
//! ```
//!
//! While `Draining` new requests are refused with `InvalidRequest`, but
//! cancellation notifications are still honoured. On reaching `Closed` every
//! request still in flight has been answered with a cancellation
//! acknowledgement.
//!
//! # Terminal responses
//!
//! Each accepted request owns one entry in the in-flight map until it is
//! answered. Whoever removes the entry sends the terminal message; anyone who
//! finds it already gone drops theirs. That is what guarantees a single
//! response per request ID when a handler, a cancellation and a drain race.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{HandlerError, RegistryError};
use crate::mcp::capability::{Capability, CapabilityKind, CapabilityMetadata, ProgressReporter, RequestContext};
use crate::mcp::protocol::{
    negotiate_version, parse_value, CancelledParams, IncomingMessage, InitializeParams, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListCapability, OutgoingMessage, PromptGetParams,
    RequestId, ResourceReadParams, ServerCapabilities, ServerInfo, ToolCallParams, ToolCallResult,
};
use crate::mcp::registry::Catalog;
use crate::mcp::transport::TransportKind;

/// Default time a draining session waits for in-flight requests.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Default time a cancelled handler gets to stop before it is abandoned.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Default capacity of the outbound message channel.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Timing and buffering knobs shared by every session of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound on the `Draining` state.
    pub drain_grace: Duration,
    /// How long to wait for a cancelled handler before acknowledging anyway.
    pub cancel_grace: Duration,
    /// Capacity of the outbound channel. Handlers wait when it is full.
    pub outbound_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

/// An outgoing message plus the request it belongs to.
///
/// `related` lets HTTP transports route progress notifications and
/// responses to the exchange that carried the request.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The message to send.
    pub message: OutgoingMessage,
    /// The request this message is about, if any.
    pub related: Option<RequestId>,
}

impl Envelope {
    /// Wraps a response or error, relating it to the ID it carries.
    #[must_use]
    pub fn reply(message: OutgoingMessage) -> Self {
        let related = message.request_id().cloned();
        Self { message, related }
    }

    /// Wraps a message that belongs to `request_id`.
    #[must_use]
    pub const fn related(message: OutgoingMessage, request_id: RequestId) -> Self {
        Self {
            message,
            related: Some(request_id),
        }
    }

    /// Wraps a message that belongs to no request.
    #[must_use]
    pub const fn unsolicited(message: OutgoingMessage) -> Self {
        Self {
            message,
            related: None,
        }
    }

    /// Returns true if this message ends its request.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.message.is_terminal()
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Accepting requests.
    Open,
    /// Refusing new requests, waiting for in-flight ones.
    Draining,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        })
    }
}

/// Outcome of [`Session::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests that finished on their own during the grace period.
    pub completed: usize,
    /// Requests still running at the deadline, acknowledged as cancelled.
    pub abandoned: usize,
}

/// MCP initialisation handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    AwaitingInit,
    /// `initialize` answered, `notifications/initialized` not yet seen.
    Initialising(&'static str),
    Ready(&'static str),
}

#[derive(Debug)]
struct InFlight {
    token: CancellationToken,
    reason: Option<String>,
}

/// What a capability invocation's result should be turned into.
#[derive(Debug)]
enum ResultShape {
    Tool,
    Resource { uri: String, mime_type: Option<String> },
    Prompt { description: Option<String> },
}

struct Invocation {
    capability: Arc<Capability>,
    arguments: Value,
    shape: ResultShape,
}

/// One logical client connection.
#[derive(Debug)]
pub struct Session {
    id: Arc<str>,
    transport: TransportKind,
    catalog: Arc<Catalog>,
    info: Arc<ServerInfo>,
    options: SessionOptions,
    outbound: mpsc::Sender<Envelope>,
    state: watch::Sender<SessionState>,
    handshake: Mutex<Handshake>,
    in_flight: Mutex<HashMap<RequestId, InFlight>>,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates an open session and the receiving end of its outbound channel.
    ///
    /// `catalog` is the registry snapshot this session dispatches against for
    /// its whole life.
    #[must_use]
    pub fn new(
        transport: TransportKind,
        catalog: Arc<Catalog>,
        info: Arc<ServerInfo>,
        options: SessionOptions,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(options.outbound_buffer.max(1));
        let session = Arc::new(Self {
            id: Arc::from(Uuid::new_v4().to_string()),
            transport,
            catalog,
            info,
            options,
            outbound,
            state: watch::Sender::new(SessionState::Open),
            handshake: Mutex::new(Handshake::AwaitingInit),
            in_flight: Mutex::new(HashMap::new()),
            pending: watch::Sender::new(0),
            cancel: CancellationToken::new(),
        });
        tracing::debug!(session_id = %session.id, transport = %transport, "Session opened");
        (session, rx)
    }

    /// Session ID (a UUID).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport the session runs over.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Registry snapshot used for dispatch.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Completes once the session is `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == SessionState::Closed)
            .await
            .map(|_| ());
    }

    /// Number of requests awaiting a terminal response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.pending.borrow()
    }

    /// Protocol version agreed during `initialize`.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&'static str> {
        match *self.lock_handshake() {
            Handshake::AwaitingInit => None,
            Handshake::Initialising(version) | Handshake::Ready(version) => Some(version),
        }
    }

    /// Returns true once the client sent `notifications/initialized`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.lock_handshake(), Handshake::Ready(_))
    }

    /// Handles one raw frame: a single message or a batch array.
    ///
    /// Malformed JSON is answered with a parse error; the session stays usable.
    pub async fn handle_raw(self: &Arc<Self>, raw: &str) {
        match serde_json::from_str(raw) {
            Ok(value) => self.handle_json(value).await,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Failed to parse incoming frame");
                self.reply(JsonRpcError::parse_error()).await;
            }
        }
    }

    /// Answers a frame the transport could not decode with a parse error.
    pub async fn reject_frame(&self, reason: &str) {
        tracing::debug!(session_id = %self.id, reason, "Rejecting undecodable frame");
        self.reply(JsonRpcError::parse_error()).await;
    }

    /// Handles a decoded frame: a single message or a batch array.
    pub async fn handle_json(self: &Arc<Self>, value: Value) {
        match value {
            Value::Array(batch) if batch.is_empty() => {
                self.reply(JsonRpcError::invalid_request_with(None, "Empty batch")).await;
            }
            Value::Array(batch) => {
                for item in batch {
                    self.handle_value(item).await;
                }
            }
            single => self.handle_value(single).await,
        }
    }

    /// Handles one decoded JSON value.
    pub async fn handle_value(self: &Arc<Self>, value: Value) {
        match parse_value(value) {
            Ok(message) => self.handle_message(message).await,
            Err(error) => self.reply(error).await,
        }
    }

    /// Handles one parsed message.
    pub async fn handle_message(self: &Arc<Self>, message: IncomingMessage) {
        match message {
            IncomingMessage::Request(req) => self.handle_request(req).await,
            IncomingMessage::Notification(notif) => self.handle_notification(&notif),
            IncomingMessage::Response(resp) => {
                tracing::debug!(session_id = %self.id, id = ?resp.id, "Ignoring client response");
            }
        }
    }

    /// Cancels an in-flight request.
    ///
    /// Returns false if the request is unknown or already answered, which
    /// the protocol treats as a no-op.
    pub fn cancel_request(&self, id: &RequestId, reason: Option<String>) -> bool {
        let mut in_flight = self.lock_in_flight();
        let Some(entry) = in_flight.get_mut(id) else {
            tracing::debug!(session_id = %self.id, request_id = %id, "Cancellation for unknown request");
            return false;
        };
        tracing::debug!(session_id = %self.id, request_id = %id, reason = ?reason, "Cancelling request");
        entry.reason = reason;
        entry.token.cancel();
        true
    }

    /// Moves the session to `Draining`, waits up to `grace` for in-flight
    /// requests, then cancels and acknowledges the rest and moves to `Closed`.
    ///
    /// Calling it again, or while another drain runs, waits for `Closed` and
    /// returns an empty report.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let mut entered = false;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Draining;
                entered = true;
            }
            entered
        });
        if !entered {
            self.closed().await;
            return DrainReport::default();
        }

        let mut pending = self.pending.subscribe();
        let started_with = *pending.borrow();
        tracing::info!(session_id = %self.id, in_flight = started_with, "Session draining");

        let idle = tokio::time::timeout(grace, async {
            pending.wait_for(|n| *n == 0).await.map(|_| ())
        })
        .await
        .is_ok();
        let abandoned = if idle { 0 } else { self.abandon_in_flight().await };

        self.cancel.cancel();
        self.state.send_replace(SessionState::Closed);
        tracing::info!(session_id = %self.id, abandoned, "Session closed");

        DrainReport {
            completed: started_with.saturating_sub(abandoned),
            abandoned,
        }
    }

    /// Drains with the configured grace period.
    pub async fn close(&self) -> DrainReport {
        self.drain(self.options.drain_grace).await
    }

    async fn handle_request(self: &Arc<Self>, req: JsonRpcRequest) {
        tracing::debug!(
            session_id = %self.id,
            request_id = %req.id,
            method = %req.method,
            "Request received"
        );

        let state = self.state();
        if state != SessionState::Open {
            self.reply(JsonRpcError::invalid_request_with(
                Some(req.id),
                format!("Session is {state}"),
            ))
            .await;
            return;
        }

        let outcome = match req.method.as_str() {
            "initialize" => self.handle_initialize(&req),
            "ping" => Ok(json!({})),
            "tools/list" | "resources/list" | "resources/templates/list" | "prompts/list" => {
                self.require_initialised(&req.id).map(|()| self.discover(&req.method))
            }
            "tools/call" | "resources/read" | "prompts/get" => {
                match self
                    .require_initialised(&req.id)
                    .and_then(|()| self.prepare_invocation(&req))
                {
                    Ok(invocation) => {
                        self.spawn_invocation(&req, invocation).await;
                        return;
                    }
                    Err(error) => Err(error),
                }
            }
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        };

        match outcome {
            Ok(result) => self.reply(JsonRpcResponse::success(req.id, result)).await,
            Err(error) => self.reply(error).await,
        }
    }

    fn handle_notification(&self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => {
                let mut handshake = self.lock_handshake();
                if let Handshake::Initialising(version) = *handshake {
                    *handshake = Handshake::Ready(version);
                    tracing::info!(session_id = %self.id, protocol = version, "Session initialised");
                } else {
                    tracing::debug!(session_id = %self.id, "Unexpected initialized notification");
                }
            }
            "notifications/cancelled" => {
                let params = notif
                    .params
                    .clone()
                    .map(serde_json::from_value::<CancelledParams>);
                match params {
                    Some(Ok(params)) => {
                        self.cancel_request(&params.request_id, params.reason);
                    }
                    _ => tracing::warn!(session_id = %self.id, "Malformed cancellation notification"),
                }
            }
            other => tracing::debug!(session_id = %self.id, method = other, "Ignoring notification"),
        }
    }

    fn handle_initialize(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let mut handshake = self.lock_handshake();
        if *handshake != Handshake::AwaitingInit {
            return Err(JsonRpcError::invalid_request_with(
                Some(req.id.clone()),
                "Session already initialised",
            ));
        }

        let params: InitializeParams = req
            .params
            .clone()
            .ok_or_else(|| JsonRpcError::invalid_params(req.id.clone(), "Missing initialize params"))
            .and_then(|params| {
                serde_json::from_value(params).map_err(|e| {
                    JsonRpcError::invalid_params(req.id.clone(), format!("Invalid initialize params: {e}"))
                })
            })?;

        let version = negotiate_version(&params.protocol_version);
        if let Some(client) = &params.client_info {
            tracing::info!(
                session_id = %self.id,
                client = %client.name,
                client_version = client.version.as_deref().unwrap_or("unknown"),
                protocol = version,
                "Client connected"
            );
        }
        *handshake = Handshake::Initialising(version);

        Ok(json!({
            "protocolVersion": version,
            "capabilities": self.capabilities(),
            "serverInfo": &*self.info,
        }))
    }

    fn capabilities(&self) -> ServerCapabilities {
        let advertise = |kind| self.catalog.has_kind(kind).then(ListCapability::default);
        ServerCapabilities {
            tools: advertise(CapabilityKind::Tool),
            resources: advertise(CapabilityKind::Resource),
            prompts: advertise(CapabilityKind::Prompt),
        }
    }

    /// Requests other than `initialize` and `ping` need a completed `initialize`.
    fn require_initialised(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if *self.lock_handshake() == Handshake::AwaitingInit {
            return Err(JsonRpcError::invalid_request_with(
                Some(id.clone()),
                "Session not initialised",
            ));
        }
        Ok(())
    }

    fn discover(&self, method: &str) -> Value {
        match method {
            "tools/list" => {
                let tools = self.catalog.list(CapabilityKind::Tool);
                json!({ "tools": tools.iter().collect::<Vec<_>>() })
            }
            "resources/list" => {
                let list = self.catalog.list(CapabilityKind::Resource);
                let resources: Vec<_> = list
                    .iter()
                    .filter(|meta| matches!(meta, CapabilityMetadata::Resource(def) if !def.is_template()))
                    .collect();
                json!({ "resources": resources })
            }
            "resources/templates/list" => {
                let list = self.catalog.list(CapabilityKind::Resource);
                let templates: Vec<Value> = list
                    .iter()
                    .filter_map(|meta| match meta {
                        CapabilityMetadata::Resource(def) if def.is_template() => Some(def.as_template_json()),
                        _ => None,
                    })
                    .collect();
                json!({ "resourceTemplates": templates })
            }
            _ => {
                let prompts = self.catalog.list(CapabilityKind::Prompt);
                json!({ "prompts": prompts.iter().collect::<Vec<_>>() })
            }
        }
    }

    fn prepare_invocation(&self, req: &JsonRpcRequest) -> Result<Invocation, JsonRpcError> {
        let id = &req.id;
        let params = req.params.clone().unwrap_or(Value::Null);

        match req.method.as_str() {
            "tools/call" => {
                let params: ToolCallParams = serde_json::from_value(params).map_err(|e| {
                    JsonRpcError::invalid_params(id.clone(), format!("Invalid tool call params: {e}"))
                })?;
                let capability = self
                    .catalog
                    .lookup(CapabilityKind::Tool, &params.name)
                    .map_err(|e| not_found(id, &e))?;
                let arguments = object_arguments(id, params.arguments)?;
                if let CapabilityMetadata::Tool(def) = capability.metadata() {
                    check_required(id, def.required_arguments(), &arguments)?;
                }
                Ok(Invocation {
                    capability,
                    arguments,
                    shape: ResultShape::Tool,
                })
            }
            "resources/read" => {
                let params: ResourceReadParams = serde_json::from_value(params).map_err(|e| {
                    JsonRpcError::invalid_params(id.clone(), format!("Invalid resource read params: {e}"))
                })?;
                let (capability, variables) = self
                    .catalog
                    .resolve_resource(&params.uri)
                    .map_err(|e| not_found(id, &e))?;

                let mut arguments = Map::new();
                arguments.insert("uri".to_string(), Value::String(params.uri.clone()));
                for (name, value) in variables {
                    arguments.insert(name, Value::String(value));
                }
                let mime_type = match capability.metadata() {
                    CapabilityMetadata::Resource(def) => def.mime_type.clone(),
                    _ => None,
                };
                Ok(Invocation {
                    capability,
                    arguments: Value::Object(arguments),
                    shape: ResultShape::Resource {
                        uri: params.uri,
                        mime_type,
                    },
                })
            }
            _ => {
                let params: PromptGetParams = serde_json::from_value(params).map_err(|e| {
                    JsonRpcError::invalid_params(id.clone(), format!("Invalid prompt params: {e}"))
                })?;
                let capability = self
                    .catalog
                    .lookup(CapabilityKind::Prompt, &params.name)
                    .map_err(|e| not_found(id, &e))?;
                let arguments = object_arguments(id, params.arguments)?;
                let description = match capability.metadata() {
                    CapabilityMetadata::Prompt(def) => {
                        let required = def.arguments.iter().filter(|a| a.required).map(|a| a.name.as_str());
                        check_required(id, required, &arguments)?;
                        def.description.clone()
                    }
                    _ => None,
                };
                Ok(Invocation {
                    capability,
                    arguments,
                    shape: ResultShape::Prompt { description },
                })
            }
        }
    }

    async fn spawn_invocation(self: &Arc<Self>, req: &JsonRpcRequest, invocation: Invocation) {
        let id = req.id.clone();
        let token = self.cancel.child_token();
        if let Err(reason) = self.track(&id, token.clone()) {
            self.reply(JsonRpcError::invalid_request_with(Some(id), reason)).await;
            return;
        }

        let progress = req
            .progress_token()
            .map(|progress_token| ProgressReporter::new(progress_token, id.clone(), self.outbound.clone()));
        let ctx = RequestContext::new(id.clone(), Arc::clone(&self.id), token.clone(), progress);
        let Invocation {
            capability,
            arguments,
            shape,
        } = invocation;

        let mut handler = tokio::spawn(capability.invoke(arguments, ctx));
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let message = tokio::select! {
                joined = &mut handler => {
                    if token.is_cancelled() {
                        session.cancellation_ack(&id)
                    } else {
                        render(&id, &shape, joined)
                    }
                }
                () = token.cancelled() => {
                    if tokio::time::timeout(session.options.cancel_grace, &mut handler).await.is_err() {
                        tracing::warn!(
                            session_id = %session.id,
                            request_id = %id,
                            "Handler ignored cancellation, abandoning it"
                        );
                    }
                    session.cancellation_ack(&id)
                }
            };
            session.finish(&id, message).await;
        });
    }

    /// Adds a request to the in-flight map.
    fn track(&self, id: &RequestId, token: CancellationToken) -> Result<(), String> {
        let mut in_flight = self.lock_in_flight();
        let state = self.state();
        if state != SessionState::Open {
            return Err(format!("Session is {state}"));
        }
        if in_flight.contains_key(id) {
            return Err(format!("Request ID {id} is already in flight"));
        }
        in_flight.insert(id.clone(), InFlight { token, reason: None });
        self.pending.send_replace(in_flight.len());
        Ok(())
    }

    /// Sends the terminal message for `id` if nobody else has.
    async fn finish(&self, id: &RequestId, message: OutgoingMessage) {
        let owned = {
            let mut in_flight = self.lock_in_flight();
            let owned = in_flight.remove(id).is_some();
            self.pending.send_replace(in_flight.len());
            owned
        };
        if owned {
            self.send(Envelope::reply(message)).await;
        } else {
            tracing::debug!(session_id = %self.id, request_id = %id, "Dropping late result");
        }
    }

    fn cancellation_ack(&self, id: &RequestId) -> OutgoingMessage {
        let reason = self
            .lock_in_flight()
            .get(id)
            .and_then(|entry| entry.reason.clone());
        JsonRpcError::cancelled(id.clone(), reason.as_deref()).into()
    }

    async fn abandon_in_flight(&self) -> usize {
        let abandoned: Vec<(RequestId, InFlight)> = {
            let mut in_flight = self.lock_in_flight();
            let entries = in_flight.drain().collect();
            self.pending.send_replace(0);
            entries
        };

        for (id, entry) in &abandoned {
            entry.token.cancel();
            tracing::warn!(session_id = %self.id, request_id = %id, "Request still running at drain deadline");
            self.reply(JsonRpcError::cancelled(id.clone(), Some("session closed"))).await;
        }
        abandoned.len()
    }

    async fn reply(&self, message: impl Into<OutgoingMessage>) {
        self.send(Envelope::reply(message.into())).await;
    }

    async fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            tracing::debug!(session_id = %self.id, "Outbound channel closed, dropping message");
        }
    }

    fn lock_handshake(&self) -> std::sync::MutexGuard<'_, Handshake> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: &RequestId, error: &RegistryError) -> JsonRpcError {
    match error {
        RegistryError::NotFound { kind, key } => JsonRpcError::capability_not_found(id.clone(), &kind.to_string(), key),
        other => JsonRpcError::internal_error(id.clone(), other.to_string()),
    }
}

fn object_arguments(id: &RequestId, arguments: Option<Value>) -> Result<Value, JsonRpcError> {
    match arguments {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(JsonRpcError::invalid_params(id.clone(), "arguments must be an object")),
    }
}

fn check_required<'a>(
    id: &RequestId,
    required: impl IntoIterator<Item = &'a str>,
    arguments: &Value,
) -> Result<(), JsonRpcError> {
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|name| arguments.get(*name).map_or(true, Value::is_null))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(JsonRpcError::invalid_params(
            id.clone(),
            format!("Missing required argument(s): {}", missing.join(", ")),
        ))
    }
}

/// Turns a handler outcome into the terminal message for `id`.
fn render(
    id: &RequestId,
    shape: &ResultShape,
    joined: Result<Result<Value, HandlerError>, JoinError>,
) -> OutgoingMessage {
    let id = id.clone();
    match joined {
        Ok(Ok(value)) => match shape_result(shape, value) {
            Ok(result) => JsonRpcResponse::success(id, result).into(),
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "Failed to serialise handler result");
                JsonRpcError::internal_error(id, "Internal error: failed to serialise result").into()
            }
        },
        Ok(Err(HandlerError::Cancelled)) => JsonRpcError::cancelled(id, None).into(),
        Ok(Err(HandlerError::InvalidParams(message))) => JsonRpcError::invalid_params(id, message).into(),
        Ok(Err(HandlerError::Tool(message))) if matches!(shape, ResultShape::Tool) => {
            match serde_json::to_value(ToolCallResult::error(message)) {
                Ok(result) => JsonRpcResponse::success(id, result).into(),
                Err(e) => JsonRpcError::internal_error(id, e.to_string()).into(),
            }
        }
        Ok(Err(HandlerError::Tool(message) | HandlerError::Internal(message))) => {
            tracing::warn!(request_id = %id, error = %message, "Handler failed");
            JsonRpcError::internal_error(id, message).into()
        }
        Err(e) if e.is_panic() => {
            tracing::error!(request_id = %id, "Handler panicked");
            JsonRpcError::internal_error(id, "Handler panicked").into()
        }
        Err(_) => JsonRpcError::cancelled(id, None).into(),
    }
}

fn shape_result(shape: &ResultShape, value: Value) -> serde_json::Result<Value> {
    match shape {
        ResultShape::Tool => tool_result(value),
        ResultShape::Resource { uri, mime_type } => Ok(resource_result(uri, mime_type.as_deref(), value)),
        ResultShape::Prompt { description } => Ok(prompt_result(description.as_deref(), value)),
    }
}

/// Strings become text content; other values also travel as `structuredContent`.
/// A value that already has a `content` array is passed through.
fn tool_result(value: Value) -> serde_json::Result<Value> {
    let result = match value {
        Value::Object(ref map) if map.get("content").is_some_and(Value::is_array) => return Ok(value),
        Value::String(text) => ToolCallResult::text(text),
        Value::Object(_) => ToolCallResult::text(value.to_string()).with_structured(value),
        other => ToolCallResult::text(other.to_string()).with_structured(json!({ "result": other })),
    };
    serde_json::to_value(result)
}

fn resource_result(uri: &str, mime_type: Option<&str>, value: Value) -> Value {
    let content = |text: String, mime_type: Option<&str>| {
        let mut item = Map::new();
        item.insert("uri".to_string(), json!(uri));
        if let Some(mime_type) = mime_type {
            item.insert("mimeType".to_string(), json!(mime_type));
        }
        item.insert("text".to_string(), Value::String(text));
        Value::Object(item)
    };

    match value {
        Value::Object(ref map) if map.contains_key("contents") => value,
        Value::Object(mut map) if map.contains_key("text") || map.contains_key("blob") => {
            map.entry("uri").or_insert_with(|| json!(uri));
            if let Some(mime_type) = mime_type {
                map.entry("mimeType").or_insert_with(|| json!(mime_type));
            }
            json!({ "contents": [map] })
        }
        Value::String(text) => json!({ "contents": [content(text, mime_type)] }),
        other => {
            let text = other.to_string();
            json!({ "contents": [content(text, Some(mime_type.unwrap_or("application/json")))] })
        }
    }
}

fn prompt_result(description: Option<&str>, value: Value) -> Value {
    let user_text = |text: String| json!({ "role": "user", "content": { "type": "text", "text": text } });

    let mut result = match value {
        Value::Object(map) if map.contains_key("messages") => Value::Object(map),
        Value::Array(messages) => json!({ "messages": messages }),
        Value::String(text) => json!({ "messages": [user_text(text)] }),
        other => json!({ "messages": [user_text(other.to_string())] }),
    };
    if let (Some(description), Some(obj)) = (description, result.as_object_mut()) {
        obj.entry("description").or_insert_with(|| json!(description));
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::mcp::capability::{PromptArgument, PromptDefinition, ResourceDefinition, ToolDefinition};
    use crate::mcp::registry::Registry;

    fn envelope_json(message: &OutgoingMessage) -> Value {
        serde_json::to_value(message).unwrap()
    }

    fn test_options() -> SessionOptions {
        SessionOptions {
            drain_grace: Duration::from_millis(200),
            cancel_grace: Duration::from_millis(50),
            outbound_buffer: 32,
        }
    }

    fn test_registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_tool(
                ToolDefinition::new("add", "Add two integers").with_input_schema(json!({
                    "type": "object",
                    "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                    "required": ["a", "b"]
                })),
                |args, _ctx| async move {
                    let a = args["a"].as_i64().ok_or_else(|| HandlerError::invalid_params("a must be an integer"))?;
                    let b = args["b"].as_i64().ok_or_else(|| HandlerError::invalid_params("b must be an integer"))?;
                    Ok(json!(a + b))
                },
            )
            .unwrap();
        registry
            .register_tool(ToolDefinition::new("wait", "Wait for cancellation"), |_args, ctx| async move {
                ctx.cancelled().await;
                Ok(json!("finished anyway"))
            })
            .unwrap();
        registry
            .register_tool(ToolDefinition::new("stubborn", "Ignore cancellation"), |_args, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("too late"))
            })
            .unwrap();
        registry
            .register_tool(ToolDefinition::new("sleep", "Sleep for ms"), |args, _ctx| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            })
            .unwrap();
        registry
            .register_tool(ToolDefinition::new("fail", "Always fails"), |_args, _ctx| async move {
                Err(HandlerError::tool("disk on fire"))
            })
            .unwrap();
        registry
            .register_tool(ToolDefinition::new("explode", "Panics"), |_args, _ctx| async move {
                if true {
                    panic!("handler bug");
                }
                Ok(Value::Null)
            })
            .unwrap();
        registry
            .register_tool(ToolDefinition::new("progress", "Reports progress"), |_args, ctx| async move {
                ctx.report_progress(1, Some(2), Some("halfway")).await;
                Ok(json!("done"))
            })
            .unwrap();
        registry
            .register_resource(
                ResourceDefinition::new("greeting://{name}", "greeting").with_mime_type("text/plain"),
                |args, _ctx| async move { Ok(json!(format!("Hello, {}!", args["name"].as_str().unwrap_or("?")))) },
            )
            .unwrap();
        registry
            .register_prompt(
                PromptDefinition::new("review", "Review code").with_argument(PromptArgument::required("code", "Code")),
                |args, _ctx| async move { Ok(json!(format!("Review this:\n{}", args["code"].as_str().unwrap_or("")))) },
            )
            .unwrap();
        registry
    }

    fn open(registry: &Registry) -> (Arc<Session>, mpsc::Receiver<Envelope>) {
        Session::new(
            TransportKind::Stdio,
            registry.snapshot(),
            Arc::new(ServerInfo::default()),
            test_options(),
        )
    }

    async fn next(rx: &mut mpsc::Receiver<Envelope>) -> Value {
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        envelope_json(&envelope.message)
    }

    async fn initialised(registry: &Registry) -> (Arc<Session>, mpsc::Receiver<Envelope>) {
        let (session, mut rx) = open(registry);
        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"test"}}}"#)
            .await;
        let init = next(&mut rx).await;
        assert_eq!(init["result"]["protocolVersion"], "2025-03-26");
        session
            .handle_raw(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(session.is_ready());
        (session, rx)
    }

    fn call(id: i64, name: &str, arguments: &Value) -> String {
        json!({"jsonrpc": "2.0", "id": id, "method": "tools/call", "params": {"name": name, "arguments": arguments}})
            .to_string()
    }

    #[tokio::test]
    async fn initialize_advertises_registered_kinds() {
        let registry = Registry::new();
        registry
            .register_tool(ToolDefinition::new("t", "t"), |_a, _c| async { Ok(Value::Null) })
            .unwrap();
        let (session, mut rx) = open(&registry);
        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#)
            .await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
        assert!(resp["result"]["capabilities"].get("tools").is_some());
        assert!(resp["result"]["capabilities"].get("prompts").is_none());
        assert_eq!(resp["result"]["serverInfo"]["name"], "mcp-host");
        assert_eq!(session.protocol_version(), Some("2024-11-05"));
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected_except_ping() {
        let registry = test_registry();
        let (session, mut rx) = open(&registry);

        session.handle_raw(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32600);

        session.handle_raw(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["id"], 2);
        assert_eq!(resp["result"], json!({}));
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;
        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":9,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#)
            .await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn add_tool_returns_sum() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(1, "add", &json!({"a": 2, "b": 3}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["content"][0]["text"], "5");
        assert_eq!(resp["result"]["structuredContent"]["result"], 5);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found_and_session_stays_open() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(2, "subtract", &json!({"a": 2, "b": 3}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["id"], 2);
        assert_eq!(resp["error"]["code"], -32002);
        assert_eq!(resp["error"]["data"]["name"], "subtract");
        assert_eq!(session.state(), SessionState::Open);

        session.handle_raw(&call(3, "add", &json!({"a": 1, "b": 1}))).await;
        assert_eq!(next(&mut rx).await["result"]["content"][0]["text"], "2");
    }

    #[tokio::test]
    async fn missing_required_argument_is_invalid_params() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(4, "add", &json!({"a": 2}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32602);
        assert!(resp["error"]["message"].as_str().unwrap().contains('b'));
    }

    #[tokio::test]
    async fn malformed_json_gets_parse_error() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw("{not json").await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32700);
        assert!(resp["id"].is_null());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(r#"{"jsonrpc":"2.0","id":5,"method":"tools/destroy"}"#).await;
        assert_eq!(next(&mut rx).await["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn tool_error_is_reported_in_result() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(6, "fail", &json!({}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(resp["result"]["content"][0]["text"], "disk on fire");
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(7, "explode", &json!({}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["error"]["code"], -32603);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn cancelled_request_is_acknowledged_once() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(8, "wait", &json!({}))).await;
        assert_eq!(session.in_flight(), 1);
        session
            .handle_raw(r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":8,"reason":"user abort"}}"#)
            .await;

        let resp = next(&mut rx).await;
        assert_eq!(resp["id"], 8);
        assert_eq!(resp["error"]["code"], -32800);
        assert_eq!(resp["error"]["data"]["reason"], "user abort");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn handler_ignoring_cancellation_is_abandoned() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(9, "stubborn", &json!({}))).await;
        assert!(session.cancel_request(&RequestId::Number(9), None));

        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32800);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_request_is_ignored() {
        let registry = test_registry();
        let (session, _rx) = initialised(&registry).await;
        assert!(!session.cancel_request(&RequestId::Number(404), None));
    }

    #[tokio::test]
    async fn concurrent_requests_keep_their_ids() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(10, "sleep", &json!({"ms": 150}))).await;
        session.handle_raw(&call(11, "sleep", &json!({"ms": 10}))).await;

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        assert_eq!(first["id"], 11);
        assert_eq!(first["result"]["structuredContent"]["result"], 10);
        assert_eq!(second["id"], 10);
        assert_eq!(second["result"]["structuredContent"]["result"], 150);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(12, "wait", &json!({}))).await;
        session.handle_raw(&call(12, "add", &json!({"a": 1, "b": 2}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32600);
        assert!(resp["error"]["message"].as_str().unwrap().contains("already in flight"));
        session.cancel_request(&RequestId::Number(12), None);
    }

    #[tokio::test]
    async fn progress_precedes_result() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        let request = json!({
            "jsonrpc": "2.0", "id": 13, "method": "tools/call",
            "params": {"name": "progress", "_meta": {"progressToken": "p-1"}}
        });
        session.handle_raw(&request.to_string()).await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.related, Some(RequestId::Number(13)));
        assert!(!envelope.is_terminal());
        let progress = envelope_json(&envelope.message);
        assert_eq!(progress["method"], "notifications/progress");
        assert_eq!(progress["params"]["progressToken"], "p-1");
        assert_eq!(progress["params"]["total"], 2);

        let resp = next(&mut rx).await;
        assert_eq!(resp["result"]["content"][0]["text"], "done");
    }

    #[tokio::test]
    async fn discovery_is_idempotent_and_reports_metadata() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(r#"{"jsonrpc":"2.0","id":20,"method":"tools/list"}"#).await;
        let first = next(&mut rx).await;
        session.handle_raw(r#"{"jsonrpc":"2.0","id":20,"method":"tools/list"}"#).await;
        let second = next(&mut rx).await;
        assert_eq!(first, second);

        let add = &first["result"]["tools"][0];
        assert_eq!(add["name"], "add");
        assert_eq!(add["description"], "Add two integers");
        assert_eq!(add["inputSchema"]["required"], json!(["a", "b"]));

        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":21,"method":"resources/templates/list"}"#)
            .await;
        let templates = next(&mut rx).await;
        assert_eq!(templates["result"]["resourceTemplates"][0]["uriTemplate"], "greeting://{name}");

        session.handle_raw(r#"{"jsonrpc":"2.0","id":22,"method":"resources/list"}"#).await;
        assert_eq!(next(&mut rx).await["result"]["resources"], json!([]));
    }

    #[tokio::test]
    async fn read_templated_resource() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":30,"method":"resources/read","params":{"uri":"greeting://ada"}}"#)
            .await;
        let resp = next(&mut rx).await;
        let content = &resp["result"]["contents"][0];
        assert_eq!(content["uri"], "greeting://ada");
        assert_eq!(content["mimeType"], "text/plain");
        assert_eq!(content["text"], "Hello, ada!");
    }

    #[tokio::test]
    async fn get_prompt_validates_arguments() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":40,"method":"prompts/get","params":{"name":"review"}}"#)
            .await;
        assert_eq!(next(&mut rx).await["error"]["code"], -32602);

        session
            .handle_raw(r#"{"jsonrpc":"2.0","id":41,"method":"prompts/get","params":{"name":"review","arguments":{"code":"x = 1"}}}"#)
            .await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["result"]["description"], "Review code");
        assert_eq!(resp["result"]["messages"][0]["role"], "user");
        assert!(resp["result"]["messages"][0]["content"]["text"]
            .as_str()
            .unwrap()
            .contains("x = 1"));
    }

    #[tokio::test]
    async fn batch_requests_are_answered_individually() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session
            .handle_raw(r#"[{"jsonrpc":"2.0","id":50,"method":"ping"},{"jsonrpc":"2.0","id":51,"method":"ping"}]"#)
            .await;
        assert_eq!(next(&mut rx).await["id"], 50);
        assert_eq!(next(&mut rx).await["id"], 51);

        session.handle_raw("[]").await;
        assert_eq!(next(&mut rx).await["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn drain_waits_for_quick_requests() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(60, "sleep", &json!({"ms": 20}))).await;
        let report = session.drain(Duration::from_secs(2)).await;
        assert_eq!(report, DrainReport { completed: 1, abandoned: 0 });
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(next(&mut rx).await["result"]["structuredContent"]["result"], 20);
    }

    #[tokio::test]
    async fn drain_abandons_stubborn_requests() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;

        session.handle_raw(&call(61, "stubborn", &json!({}))).await;
        let report = session.drain(Duration::from_millis(50)).await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(session.state(), SessionState::Closed);

        let resp = next(&mut rx).await;
        assert_eq!(resp["id"], 61);
        assert_eq!(resp["error"]["code"], -32800);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn closed_session_refuses_requests() {
        let registry = test_registry();
        let (session, mut rx) = initialised(&registry).await;
        session.close().await;

        session.handle_raw(&call(70, "add", &json!({"a": 1, "b": 1}))).await;
        let resp = next(&mut rx).await;
        assert_eq!(resp["error"]["code"], -32600);
        assert_eq!(resp["error"]["message"], "Session is closed");
    }

    #[tokio::test]
    async fn second_drain_returns_empty_report() {
        let registry = test_registry();
        let (session, _rx) = initialised(&registry).await;
        session.close().await;
        assert_eq!(session.close().await, DrainReport::default());
    }

    #[tokio::test]
    async fn drain_cancels_cooperative_handlers() {
        let observed = Arc::new(AtomicBool::new(false));
        let registry = Registry::new();
        let flag = Arc::clone(&observed);
        registry
            .register_tool(ToolDefinition::new("watch", "watch"), move |_a, ctx| {
                let flag = Arc::clone(&flag);
                async move {
                    ctx.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Err(HandlerError::Cancelled)
                }
            })
            .unwrap();
        let (session, _rx) = initialised(&registry).await;

        session.handle_raw(&call(80, "watch", &json!({}))).await;
        let report = session.drain(Duration::from_millis(20)).await;
        assert_eq!(report.abandoned, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(observed.load(Ordering::SeqCst));
    }
}
