//! Streamable HTTP transport.
//!
//! One endpoint serves three methods:
//!
//! - `POST` carries client messages. Requests are answered on the same
//!   exchange, either as an SSE stream or as a JSON body
//! - `GET` opens the standalone server-to-client event stream
//! - `DELETE` ends the session
//!
//! Sessions are keyed by the `Mcp-Session-Id` header. Each session has a
//! [`Relay`] that reads the session's outbound queue and hands every
//! envelope to the exchange waiting on its request ID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::mcp::manager::{ManagerSlot, SessionManager};
use crate::mcp::protocol::{parse_value, IncomingMessage, JsonRpcError, OutgoingMessage, RequestId};
use crate::mcp::session::{Envelope, Session};
use crate::mcp::transport::{accepts_event_stream, HttpError, Outbound, TransportKind};

/// Header carrying the session ID.
pub const MCP_SESSION_ID: &str = "mcp-session-id";

type RelayMap = Arc<Mutex<HashMap<String, Arc<Relay>>>>;

#[derive(Clone)]
struct HttpState {
    slot: ManagerSlot,
    relays: RelayMap,
}

/// Builds the router serving the protocol endpoint at `path`.
///
/// `path` must start with `/`.
pub fn router(slot: ManagerSlot, path: &str) -> Router {
    let state = HttpState {
        slot,
        relays: Arc::default(),
    };
    Router::new()
        .route(path, post(handle_post).get(handle_get).delete(handle_delete))
        .with_state(state)
}

/// Routes one session's outbound envelopes to HTTP exchanges.
#[derive(Debug, Default)]
struct Relay {
    waiters: Mutex<HashMap<RequestId, mpsc::UnboundedSender<OutgoingMessage>>>,
    standalone: Mutex<Option<Standalone>>,
    next_stream: AtomicU64,
}

#[derive(Debug)]
struct Standalone {
    stream: u64,
    tx: mpsc::Sender<OutgoingMessage>,
}

impl Relay {
    fn route(&self, envelope: Envelope) {
        let Envelope { message, related } = envelope;

        let message = match related {
            Some(id) => {
                let waiter = {
                    let mut waiters = self.lock_waiters();
                    if message.is_terminal() {
                        waiters.remove(&id)
                    } else {
                        waiters.get(&id).cloned()
                    }
                };
                match waiter {
                    Some(waiter) => match waiter.send(message) {
                        Ok(()) => return,
                        Err(mpsc::error::SendError(message)) => message,
                    },
                    None => message,
                }
            }
            None => message,
        };

        match self.lock_standalone().as_ref() {
            Some(standalone) => {
                if standalone.tx.try_send(message).is_err() {
                    tracing::warn!("Standalone stream is full or gone, dropping message");
                }
            }
            None => tracing::debug!("No stream open for message, dropping it"),
        }
    }

    /// Opens the standalone stream. Returns `None` if one is already open.
    fn attach(&self, tx: mpsc::Sender<OutgoingMessage>) -> Option<u64> {
        let mut standalone = self.lock_standalone();
        if standalone.as_ref().is_some_and(|s| !s.tx.is_closed()) {
            return None;
        }
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
        *standalone = Some(Standalone { stream, tx });
        Some(stream)
    }

    fn detach(&self, stream: u64) {
        let mut standalone = self.lock_standalone();
        if standalone.as_ref().is_some_and(|s| s.stream == stream) {
            *standalone = None;
        }
    }

    /// Ends every exchange and stream waiting on this relay.
    fn close(&self) {
        self.lock_waiters().clear();
        self.lock_standalone().take();
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<RequestId, mpsc::UnboundedSender<OutgoingMessage>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_standalone(&self) -> MutexGuard<'_, Option<Standalone>> {
        self.standalone.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump(relay: Arc<Relay>, mut outbound: Outbound, relays: RelayMap, session_id: String) {
    while let Some(envelope) = outbound.next().await {
        relay.route(envelope);
    }
    relay.close();
    lock_relays(&relays).remove(&session_id);
    tracing::debug!(session_id = %session_id, "Relay stopped");
}

/// Removes an exchange's waiters when its response is dropped.
struct WaiterGuard {
    relay: Arc<Relay>,
    ids: Vec<RequestId>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self.relay.lock_waiters();
        for id in &self.ids {
            waiters.remove(id);
        }
    }
}

/// Detaches the standalone stream when the client goes away.
struct StandaloneGuard {
    relay: Arc<Relay>,
    stream: u64,
}

impl Drop for StandaloneGuard {
    fn drop(&mut self) {
        self.relay.detach(self.stream);
    }
}

impl HttpState {
    fn open_session(&self, manager: &SessionManager) -> (Arc<Session>, Arc<Relay>) {
        let (session, rx) = manager.create(TransportKind::StreamableHttp);
        let relay = Arc::new(Relay::default());
        let session_id = session.id().to_string();

        lock_relays(&self.relays).insert(session_id.clone(), Arc::clone(&relay));
        tokio::spawn(pump(
            Arc::clone(&relay),
            Outbound::new(rx, &session),
            Arc::clone(&self.relays),
            session_id,
        ));

        tracing::info!(session_id = session.id(), "Streamable HTTP session created");
        (session, relay)
    }

    fn resolve(&self, manager: &SessionManager, id: &str) -> Result<(Arc<Session>, Arc<Relay>), HttpError> {
        let session = manager.get(id).ok_or_else(HttpError::session_not_found)?;
        let relay = lock_relays(&self.relays)
            .get(id)
            .cloned()
            .ok_or_else(HttpError::session_not_found)?;
        Ok((session, relay))
    }
}

fn lock_relays(relays: &RelayMap) -> MutexGuard<'_, HashMap<String, Arc<Relay>>> {
    relays.lock().unwrap_or_else(PoisonError::into_inner)
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(MCP_SESSION_ID).and_then(|value| value.to_str().ok())
}

fn missing_session_header() -> HttpError {
    HttpError::bad_request("Missing Mcp-Session-Id header")
}

fn message_event(message: &OutgoingMessage) -> Result<Event, axum::Error> {
    Event::default().event("message").json_data(message)
}

fn with_session_id(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(MCP_SESSION_ID, value);
    }
    response
}

fn json_reply(mut replies: Vec<OutgoingMessage>, batched: bool) -> Response {
    if !batched && replies.len() == 1 {
        if let Some(reply) = replies.pop() {
            return Json(reply).into_response();
        }
    }
    Json(replies).into_response()
}

async fn handle_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let manager = state.slot.get()?;

    let value: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(error = %e, "Rejecting unparsable POST body");
        HttpError::parse_error()
    })?;
    let batched = value.is_array();
    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    if items.is_empty() {
        return Err(HttpError::bad_request("Empty batch"));
    }

    let mut direct: Vec<OutgoingMessage> = Vec::new();
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        match parse_value(item) {
            Ok(message) => messages.push(message),
            Err(error) => direct.push(error.into()),
        }
    }

    let initialises = messages
        .iter()
        .any(|m| m.is_request() && m.method() == "initialize");
    let (session, relay) = match session_header(&headers) {
        Some(id) => state.resolve(&manager, id)?,
        None if initialises => state.open_session(&manager),
        None => return Err(missing_session_header()),
    };

    // Waiters are registered before dispatch so no reply can outrun them.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut forward = Vec::with_capacity(messages.len());
    let mut ids = Vec::new();
    {
        let mut waiters = relay.lock_waiters();
        for message in messages {
            if let IncomingMessage::Request(request) = &message {
                if waiters.contains_key(&request.id) {
                    direct.push(
                        JsonRpcError::invalid_request_with(Some(request.id.clone()), "Duplicate request id")
                            .into(),
                    );
                    continue;
                }
                waiters.insert(request.id.clone(), tx.clone());
                ids.push(request.id.clone());
            }
            forward.push(message);
        }
    }
    drop(tx);
    let awaiting = !ids.is_empty();
    let guard = WaiterGuard {
        relay: Arc::clone(&relay),
        ids,
    };

    for message in forward {
        session.handle_message(message).await;
    }

    if !awaiting {
        drop(guard);
        let response = if direct.is_empty() {
            StatusCode::ACCEPTED.into_response()
        } else {
            json_reply(direct, batched)
        };
        return Ok(with_session_id(response, session.id()));
    }

    if accepts_event_stream(&headers) {
        let related = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let message = rx.recv().await?;
            Some((message, (rx, guard)))
        });
        let events = tokio_stream::iter(direct)
            .chain(related)
            .map(|message| message_event(&message));
        let response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
        return Ok(with_session_id(response, session.id()));
    }

    let mut replies = direct;
    while let Some(message) = rx.recv().await {
        if message.is_terminal() {
            replies.push(message);
        }
    }
    drop(guard);

    if replies.is_empty() {
        return Err(HttpError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Session closed before replying",
        ));
    }
    Ok(with_session_id(json_reply(replies, batched), session.id()))
}

async fn handle_get(State(state): State<HttpState>, headers: HeaderMap) -> Result<Response, HttpError> {
    let manager = state.slot.get()?;
    if !accepts_event_stream(&headers) {
        return Err(HttpError::new(
            StatusCode::NOT_ACCEPTABLE,
            "Client must accept text/event-stream",
        ));
    }
    let id = session_header(&headers).ok_or_else(missing_session_header)?;
    let (session, relay) = state.resolve(&manager, id)?;

    let (tx, rx) = mpsc::channel(manager.options().outbound_buffer.max(1));
    let stream_id = relay.attach(tx).ok_or_else(|| {
        HttpError::new(StatusCode::CONFLICT, "A standalone stream is already open for this session")
    })?;
    tracing::debug!(session_id = session.id(), "Standalone stream opened");

    let guard = StandaloneGuard {
        relay,
        stream: stream_id,
    };
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let message = rx.recv().await?;
        Some((message_event(&message), (rx, guard)))
    });
    let response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    Ok(with_session_id(response, session.id()))
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> Result<StatusCode, HttpError> {
    let manager = state.slot.get()?;
    let id = session_header(&headers).ok_or_else(missing_session_header)?;

    let report = manager.close(id).await.ok_or_else(HttpError::session_not_found)?;
    tracing::info!(
        session_id = id,
        completed = report.completed,
        abandoned = report.abandoned,
        "Session terminated by client"
    );
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::mcp::capability::ToolDefinition;
    use crate::mcp::protocol::{JsonRpcResponse, ServerInfo};
    use crate::mcp::registry::Registry;
    use crate::mcp::session::SessionOptions;

    fn slot_with_manager() -> (ManagerSlot, Arc<SessionManager>) {
        let registry = Arc::new(Registry::new());
        registry
            .register_tool(ToolDefinition::new("echo", "Echo"), |args, _ctx| async move { Ok(args) })
            .unwrap();
        let manager = Arc::new(SessionManager::new(
            registry,
            ServerInfo::default(),
            SessionOptions {
                drain_grace: Duration::from_millis(50),
                ..SessionOptions::default()
            },
        ));
        let slot = ManagerSlot::new("/mcp");
        slot.install(Arc::clone(&manager));
        (slot, manager)
    }

    fn post_json(body: &Value, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json");
        if let Some(id) = session {
            builder = builder.header(MCP_SESSION_ID, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn initialize() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}, "clientInfo": {"name": "t", "version": "1"}}
        })
    }

    #[tokio::test]
    async fn initialize_creates_session() {
        let (slot, manager) = slot_with_manager();
        let app = router(slot, "/mcp");

        let response = app.oneshot(post_json(&initialize(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();
        assert!(manager.get(&id).is_some());

        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn missing_and_unknown_session_ids() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/mcp");
        let ping = json!({"jsonrpc": "2.0", "id": 2, "method": "ping"});

        let response = app.clone().oneshot(post_json(&ping, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(post_json(&ping, Some("nope"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_are_accepted() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/mcp");

        let response = app.clone().oneshot(post_json(&initialize(), None)).await.unwrap();
        let id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

        let initialised = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let response = app.oneshot(post_json(&initialised, Some(&id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unparsable_body_is_a_parse_error() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/mcp");
        let request = Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn get_requires_event_stream() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/mcp");
        let request = Request::builder()
            .method(Method::GET)
            .uri("/mcp")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn second_standalone_stream_conflicts() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/mcp");
        let response = app.clone().oneshot(post_json(&initialize(), None)).await.unwrap();
        let id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

        let get = || {
            Request::builder()
                .method(Method::GET)
                .uri("/mcp")
                .header(header::ACCEPT, "text/event-stream")
                .header(MCP_SESSION_ID, id.as_str())
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(get()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(get()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        drop(first);
        let third = app.oneshot(get()).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_closes_session() {
        let (slot, manager) = slot_with_manager();
        let app = router(slot, "/mcp");
        let response = app.clone().oneshot(post_json(&initialize(), None)).await.unwrap();
        let id = response.headers()[MCP_SESSION_ID].to_str().unwrap().to_string();

        let delete = || {
            Request::builder()
                .method(Method::DELETE)
                .uri("/mcp")
                .header(MCP_SESSION_ID, id.as_str())
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(manager.get(&id).is_none());

        let response = app.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_slot_answers_503() {
        let app = router(ManagerSlot::new("/mcp"), "/mcp");
        let response = app.oneshot(post_json(&initialize(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert!(body["error"]["message"].as_str().unwrap().contains("lifespan"));
    }

    #[test]
    fn relay_routes_by_request_id() {
        let relay = Relay::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.lock_waiters().insert(RequestId::Number(7), tx);

        let reply = JsonRpcResponse::success(RequestId::Number(7), json!({}));
        relay.route(Envelope::reply(reply.into()));

        assert!(rx.try_recv().unwrap().is_terminal());
        assert!(relay.lock_waiters().is_empty());
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn unrelated_messages_go_to_the_standalone_stream() {
        let relay = Relay::default();
        let (tx, mut rx) = mpsc::channel(4);
        let stream = relay.attach(tx).unwrap();

        let reply = JsonRpcResponse::success(RequestId::Number(9), json!({}));
        relay.route(Envelope::reply(reply.into()));
        assert!(rx.try_recv().is_ok());

        relay.detach(stream);
        assert!(relay.lock_standalone().is_none());
    }
}
