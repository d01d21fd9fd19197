//! Transport adapters.
//!
//! Each adapter turns one kind of physical connection into calls on a
//! [`Session`](crate::mcp::session::Session) and relays the session's outbound
//! envelopes back:
//!
//! - [`stdio`]: one session per process, newline or `Content-Length` framing
//! - [`streamable_http`]: one endpoint, sessions keyed by `Mcp-Session-Id`
//! - [`sse`]: legacy split endpoints, an event stream plus a POST path
//!
//! Adapters never own sessions. They hold a
//! [`SessionHandle`](crate::mcp::manager::SessionHandle) or look sessions up
//! in the [`SessionManager`](crate::mcp::manager::SessionManager) per request.

pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::fmt;
use std::str::FromStr;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::error::ServerError;
use crate::mcp::session::{Envelope, Session, SessionState};

/// Default listen host for HTTP transports.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port for HTTP transports.
pub const DEFAULT_PORT: u16 = 8000;

/// Default endpoint of the streamable HTTP transport.
pub const DEFAULT_STREAMABLE_HTTP_PATH: &str = "/mcp";

/// Default event-stream path of the SSE transport.
pub const DEFAULT_SSE_PATH: &str = "/sse";

/// Default message-post path of the SSE transport.
pub const DEFAULT_MESSAGE_PATH: &str = "/messages/";

/// The available transports.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Standard input and output of the process.
    #[default]
    Stdio,
    /// Streamable HTTP on a single endpoint.
    StreamableHttp,
    /// Legacy server-sent events with a separate POST endpoint.
    Sse,
}

impl TransportKind {
    /// Returns true for the HTTP-based transports.
    #[must_use]
    pub const fn is_http(self) -> bool {
        !matches!(self, Self::Stdio)
    }

    /// Canonical name, as accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::StreamableHttp => "streamable-http",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "streamable-http" | "http" => Ok(Self::StreamableHttp),
            "sse" => Ok(Self::Sse),
            other => Err(format!(
                "unknown transport '{other}'. Must be one of: stdio, streamable-http, sse"
            )),
        }
    }
}

/// Where an HTTP transport listens. Ignored by stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBinding {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Protocol endpoint (streamable HTTP) or event-stream path (SSE).
    pub path: String,
    /// Message-post path (SSE only).
    pub message_path: String,
}

impl TransportBinding {
    /// Default binding for a transport.
    #[must_use]
    pub fn for_transport(kind: TransportKind) -> Self {
        let path = match kind {
            TransportKind::Sse => DEFAULT_SSE_PATH,
            TransportKind::Stdio | TransportKind::StreamableHttp => DEFAULT_STREAMABLE_HTTP_PATH,
        };
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: path.to_string(),
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for TransportBinding {
    fn default() -> Self {
        Self::for_transport(TransportKind::StreamableHttp)
    }
}

/// Completes on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Failed to install signal handlers, shutdown only on EOF");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Completes on Ctrl+C.
#[cfg(windows)]
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C, shutdown only on EOF");
            std::future::pending::<()>().await;
        }
    }
}

/// Completes when the watched session reaches `Closed` or is dropped.
pub(crate) async fn session_closed(state: &mut watch::Receiver<SessionState>) {
    let _ = state
        .wait_for(|state| *state == SessionState::Closed)
        .await
        .map(|_| ());
}

/// A session's outbound queue, bounded by the session's lifetime.
///
/// Yields envelopes until the session closes, then whatever was already
/// queued, then `None`. Leaked handlers holding a sender cannot keep it open.
#[derive(Debug)]
pub(crate) struct Outbound {
    rx: mpsc::Receiver<Envelope>,
    state: watch::Receiver<SessionState>,
    closing: bool,
}

impl Outbound {
    pub(crate) fn new(rx: mpsc::Receiver<Envelope>, session: &Session) -> Self {
        Self {
            rx,
            state: session.subscribe_state(),
            closing: false,
        }
    }

    pub(crate) async fn next(&mut self) -> Option<Envelope> {
        loop {
            tokio::select! {
                biased;
                envelope = self.rx.recv() => return envelope,
                () = session_closed(&mut self.state), if !self.closing => {
                    self.rx.close();
                    self.closing = true;
                }
            }
        }
    }
}

/// Returns true if the `Accept` header allows `text/event-stream`.
pub(crate) fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/event-stream"))
}

/// An HTTP-level failure, rendered as a JSON-RPC error body.
#[derive(Debug)]
pub(crate) struct HttpError {
    status: StatusCode,
    code: i32,
    message: String,
}

impl HttpError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: -32000,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn parse_error() -> Self {
        Self {
            code: -32700,
            ..Self::bad_request("Parse error")
        }
    }

    pub(crate) fn session_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Session not found")
    }
}

impl From<ServerError> for HttpError {
    fn from(error: ServerError) -> Self {
        let status = match error {
            ServerError::LifespanNotStarted { .. } => {
                tracing::error!(error = %error, "Request reached an app whose lifespan was never started");
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}
