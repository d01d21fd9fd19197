//! Legacy SSE transport.
//!
//! Two endpoints:
//!
//! - `GET <sse_path>` opens a session and its event stream. The first event
//!   is `endpoint`, carrying the URL to post messages to
//! - `POST <message_path>?session_id=<id>` delivers one client frame and is
//!   answered with `202 Accepted`; replies travel on the event stream
//!
//! The endpoint URL is built from the original request URI, so it stays
//! correct however deeply the router is nested.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::mcp::manager::{ManagerSlot, SessionManager};
use crate::mcp::protocol::OutgoingMessage;
use crate::mcp::transport::{HttpError, Outbound, TransportKind};

#[derive(Clone)]
struct SseState {
    slot: ManagerSlot,
    message_path: Arc<str>,
}

/// Builds the router serving the event stream at `sse_path` and message
/// posts at `message_path`. Both must start with `/` and differ.
pub fn router(slot: ManagerSlot, sse_path: &str, message_path: &str) -> Router {
    let state = SseState {
        slot,
        message_path: Arc::from(message_path),
    };
    Router::new()
        .route(sse_path, get(handle_stream))
        .route(message_path, post(handle_post))
        .with_state(state)
}

/// Closes the session once its event stream is dropped.
struct SessionGuard {
    manager: Arc<SessionManager>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let manager = Arc::clone(&self.manager);
        let session_id = std::mem::take(&mut self.session_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = %session_id, "No runtime to drain SSE session on disconnect");
            return;
        };
        runtime.spawn(async move {
            if let Some(report) = manager.close(&session_id).await {
                tracing::info!(
                    session_id = %session_id,
                    completed = report.completed,
                    abandoned = report.abandoned,
                    "SSE stream closed, session drained"
                );
            }
        });
    }
}

/// Everything the router was mounted under.
fn mount_prefix<'a>(original: &'a Uri, routed: &Uri) -> &'a str {
    original
        .path()
        .strip_suffix(routed.path())
        .unwrap_or_default()
        .trim_end_matches('/')
}

fn message_event(message: &OutgoingMessage) -> Result<Event, axum::Error> {
    Event::default().event("message").json_data(message)
}

async fn handle_stream(
    State(state): State<SseState>,
    OriginalUri(original): OriginalUri,
    uri: Uri,
) -> Result<impl IntoResponse, HttpError> {
    let manager = state.slot.get()?;

    let (session, rx) = manager.create(TransportKind::Sse);
    let outbound = Outbound::new(rx, &session);
    let session_id = session.id().to_string();
    drop(session);

    let endpoint = format!(
        "{}{}?session_id={session_id}",
        mount_prefix(&original, &uri),
        state.message_path
    );
    tracing::info!(session_id = %session_id, endpoint = %endpoint, "SSE session opened");

    let guard = SessionGuard {
        manager,
        session_id,
    };
    let first = tokio_stream::once(Ok(Event::default().event("endpoint").data(endpoint)));
    let messages = stream::unfold((outbound, guard), |(mut outbound, guard)| async move {
        let envelope = outbound.next().await?;
        Some((message_event(&envelope.message), (outbound, guard)))
    });

    Ok(Sse::new(first.chain(messages)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn handle_post(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<StatusCode, HttpError> {
    let manager = state.slot.get()?;

    let session_id = query
        .session_id
        .ok_or_else(|| HttpError::bad_request("Missing session_id query parameter"))?;
    let session = manager
        .get(&session_id)
        .ok_or_else(HttpError::session_not_found)?;

    let value: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(session_id = %session_id, error = %e, "Rejecting unparsable message");
        HttpError::parse_error()
    })?;

    session.handle_json(value).await;
    Ok(StatusCode::ACCEPTED)
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
    use crate::mcp::protocol::ServerInfo;
    use crate::mcp::registry::Registry;
    use crate::mcp::session::SessionOptions;

    fn slot_with_manager() -> (ManagerSlot, Arc<SessionManager>) {
        let manager = Arc::new(SessionManager::new(
            Arc::new(Registry::new()),
            ServerInfo::default(),
            SessionOptions {
                drain_grace: Duration::from_millis(50),
                ..SessionOptions::default()
            },
        ));
        let slot = ManagerSlot::new("/sse");
        slot.install(Arc::clone(&manager));
        (slot, manager)
    }

    fn open_stream(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .unwrap()
    }

    async fn next_event(body: &mut Body) -> String {
        let frame = body.frame().await.unwrap().unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    fn endpoint_of(event: &str) -> String {
        event
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap()
            .to_string()
    }

    #[test]
    fn prefix_is_what_nesting_stripped() {
        let original: Uri = "/api/v1/sse".parse().unwrap();
        let routed: Uri = "/sse".parse().unwrap();
        assert_eq!(mount_prefix(&original, &routed), "/api/v1");
        assert_eq!(mount_prefix(&routed, &routed), "");
    }

    #[tokio::test]
    async fn first_event_is_the_endpoint() {
        let (slot, manager) = slot_with_manager();
        let app = router(slot, "/sse", "/messages/");

        let response = app.oneshot(open_stream("/sse")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        let event = next_event(&mut body).await;
        assert!(event.starts_with("event: endpoint"));
        let endpoint = endpoint_of(&event);
        let session_id = endpoint.strip_prefix("/messages/?session_id=").unwrap();
        assert!(manager.get(session_id).is_some());
    }

    #[tokio::test]
    async fn endpoint_includes_mount_prefix() {
        let (slot, _manager) = slot_with_manager();
        let app = Router::new().nest("/tenant/a", router(slot, "/sse", "/messages/"));

        let response = app.oneshot(open_stream("/tenant/a/sse")).await.unwrap();
        let mut body = response.into_body();
        let endpoint = endpoint_of(&next_event(&mut body).await);
        assert!(endpoint.starts_with("/tenant/a/messages/?session_id="));
    }

    #[tokio::test]
    async fn posted_messages_are_answered_on_the_stream() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/sse", "/messages/");

        let response = app.clone().oneshot(open_stream("/sse")).await.unwrap();
        let mut body = response.into_body();
        let endpoint = endpoint_of(&next_event(&mut body).await);

        let post = Request::builder()
            .method(Method::POST)
            .uri(&endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}).to_string()))
            .unwrap();
        let response = app.oneshot(post).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let event = next_event(&mut body).await;
        assert!(event.starts_with("event: message"));
        let data: Value = serde_json::from_str(&endpoint_of(&event)).unwrap();
        assert_eq!(data["id"], 3);
        assert_eq!(data["result"], json!({}));
    }

    #[tokio::test]
    async fn post_errors() {
        let (slot, _manager) = slot_with_manager();
        let app = router(slot, "/sse", "/messages/");
        let post = |uri: &str, body: &str| {
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = app.clone().oneshot(post("/messages/", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post("/messages/?session_id=missing", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let stream = app.clone().oneshot(open_stream("/sse")).await.unwrap();
        let mut body = stream.into_body();
        let endpoint = endpoint_of(&next_event(&mut body).await);
        let response = app.oneshot(post(&endpoint, "{oops")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_the_session() {
        let (slot, manager) = slot_with_manager();
        let app = router(slot, "/sse", "/messages/");

        let response = app.oneshot(open_stream("/sse")).await.unwrap();
        let mut body = response.into_body();
        let _ = next_event(&mut body).await;
        assert_eq!(manager.len(), 1);

        drop(body);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !manager.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
