//! MCP wire types.
//!
//! Everything a client and this server exchange is JSON-RPC 2.0. Incoming
//! frames are classified by [`parse_value`] into requests, notifications or
//! (rare) client responses; outgoing traffic is an [`OutgoingMessage`].
//!
//! Request IDs are integers or strings. A `null` ID is rejected as an
//! invalid request, and error replies to frames whose ID cannot be recovered
//! carry `"id": null`.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The newest MCP protocol version this implementation supports.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every protocol version accepted during initialisation, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[MCP_PROTOCOL_VERSION, "2024-11-05"];

/// Name reported in `serverInfo` unless the host overrides it.
pub const SERVER_NAME: &str = "mcp-host";

/// Numeric error codes used on the wire.
pub mod codes {
    /// The frame is not valid JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON is not a usable JSON-RPC message.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No such method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Parameters failed validation.
    pub const INVALID_PARAMS: i32 = -32602;
    /// The server failed while answering.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The named tool, resource or prompt is not registered.
    pub const CAPABILITY_NOT_FOUND: i32 = -32002;
    /// Acknowledges a cancelled request.
    pub const REQUEST_CANCELLED: i32 = -32800;
}

/// The `"jsonrpc": "2.0"` member. Deserialising anything else fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == "2.0" {
            Ok(Self)
        } else {
            Err(de::Error::invalid_value(de::Unexpected::Str(&tag), &"\"2.0\""))
        }
    }
}

/// Correlates a response with its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer ID.
    Number(i64),
    /// String ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

/// A client request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    _version: Version,
    /// ID the reply must carry.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Raw parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Builds a request, mostly for tests and in-process clients.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            _version: Version,
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// The `_meta.progressToken` the client attached, if it is a string or
    /// an integer.
    #[must_use]
    pub fn progress_token(&self) -> Option<Value> {
        let token = self.params.as_ref()?.get("_meta")?.get("progressToken")?;
        (token.is_string() || token.is_i64() || token.is_u64()).then(|| token.clone())
    }
}

/// A client notification. Never answered.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(rename = "jsonrpc")]
    _version: Version,
    /// Method name, e.g. `notifications/cancelled`.
    pub method: String,
    /// Raw parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

/// A notification sent by the server.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingNotification {
    jsonrpc: Version,
    /// Method name.
    pub method: String,
    /// Parameters, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingNotification {
    /// Builds a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }

    /// `notifications/progress` for the request that supplied `token`.
    ///
    /// `total` and `message` are left out of the payload when `None`.
    #[must_use]
    pub fn progress(token: &Value, progress: u64, total: Option<u64>, message: Option<&str>) -> Self {
        let mut params = Map::new();
        params.insert("progressToken".into(), token.clone());
        params.insert("progress".into(), progress.into());
        if let Some(total) = total {
            params.insert("total".into(), total.into());
        }
        if let Some(message) = message {
            params.insert("message".into(), message.into());
        }
        Self::new("notifications/progress", Some(Value::Object(params)))
    }
}

/// A successful reply.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: Version,
    /// ID of the request being answered.
    pub id: RequestId,
    /// Method result.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Answers request `id` with `result`.
    #[must_use]
    pub const fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result,
        }
    }
}

/// The `error` member of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    /// One of [`codes`].
    pub code: i32,
    /// Human-readable summary.
    pub message: String,
    /// Structured detail, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// An error without data.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// An error reply. `id` is `null` when the request ID was unrecoverable.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    jsonrpc: Version,
    /// ID of the request being answered.
    pub id: Option<RequestId>,
    /// What went wrong.
    pub error: ErrorObject,
}

impl JsonRpcError {
    /// Wraps an [`ErrorObject`].
    #[must_use]
    pub const fn new(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            error,
        }
    }

    /// The frame was not JSON.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(None, ErrorObject::new(codes::PARSE_ERROR, "Parse error"))
    }

    /// The frame was JSON but not a valid message.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>) -> Self {
        Self::invalid_request_with(id, "Invalid Request")
    }

    /// Like [`invalid_request`](Self::invalid_request) with a specific reason.
    #[must_use]
    pub fn invalid_request_with(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, ErrorObject::new(codes::INVALID_REQUEST, message))
    }

    /// No handler for `method`.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(
            Some(id),
            ErrorObject::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}")),
        )
    }

    /// The parameters were rejected.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(Some(id), ErrorObject::new(codes::INVALID_PARAMS, message))
    }

    /// The server failed while answering.
    #[must_use]
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(Some(id), ErrorObject::new(codes::INTERNAL_ERROR, message))
    }

    /// No capability of `kind` is registered under `key`.
    ///
    /// `data` repeats kind and key so clients need not parse the message.
    #[must_use]
    pub fn capability_not_found(id: RequestId, kind: &str, key: &str) -> Self {
        let error = ErrorObject::new(codes::CAPABILITY_NOT_FOUND, format!("{kind} not found: {key}"))
            .with_data(json!({ "kind": kind, "name": key }));
        Self::new(Some(id), error)
    }

    /// The terminal reply of a cancelled request.
    #[must_use]
    pub fn cancelled(id: RequestId, reason: Option<&str>) -> Self {
        let mut error = ErrorObject::new(codes::REQUEST_CANCELLED, "Request cancelled");
        if let Some(reason) = reason {
            error = error.with_data(json!({ "reason": reason }));
        }
        Self::new(Some(id), error)
    }

    /// True for cancellation acknowledgements.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        self.error.code == codes::REQUEST_CANCELLED
    }
}

/// Anything the server writes to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    /// Successful reply.
    Response(JsonRpcResponse),
    /// Error reply.
    Error(JsonRpcError),
    /// Server notification.
    Notification(OutgoingNotification),
}

impl OutgoingMessage {
    /// ID of the request a reply answers. `None` for notifications and for
    /// errors about unidentifiable frames.
    #[must_use]
    pub const fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Response(r) => Some(&r.id),
            Self::Error(e) => e.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// True for replies, which end their request.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }

    /// One line of compact JSON.
    ///
    /// # Errors
    ///
    /// Fails only if a payload holds a value serde cannot encode.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<JsonRpcResponse> for OutgoingMessage {
    fn from(r: JsonRpcResponse) -> Self {
        Self::Response(r)
    }
}

impl From<JsonRpcError> for OutgoingMessage {
    fn from(e: JsonRpcError) -> Self {
        Self::Error(e)
    }
}

impl From<OutgoingNotification> for OutgoingMessage {
    fn from(n: OutgoingNotification) -> Self {
        Self::Notification(n)
    }
}

/// A reply from the client. The server issues no requests of its own, so
/// these are logged and dropped.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    /// The echoed ID, when it is a valid one.
    pub id: Option<RequestId>,
    /// The whole frame.
    pub body: Value,
}

/// A classified client message.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Needs exactly one reply.
    Request(JsonRpcRequest),
    /// Never answered.
    Notification(JsonRpcNotification),
    /// Reply to a server request.
    Response(ClientResponse),
}

impl IncomingMessage {
    /// Method name; empty for client responses.
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Request(r) => &r.method,
            Self::Notification(n) => &n.method,
            Self::Response(_) => "",
        }
    }

    /// True for requests.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Decodes and classifies one JSON text.
///
/// # Errors
///
/// A parse error for malformed JSON, otherwise whatever [`parse_value`]
/// reports.
pub fn parse_message(text: &str) -> Result<IncomingMessage, JsonRpcError> {
    let value = serde_json::from_str(text).map_err(|_| JsonRpcError::parse_error())?;
    parse_value(value)
}

/// Classifies one decoded JSON value.
///
/// A value with `method` and `id` is a request, with `method` alone a
/// notification, and with `result` or `error` but no `method` a client
/// response.
///
/// # Errors
///
/// An invalid-request error, carrying the request ID when it can be read.
pub fn parse_value(value: Value) -> Result<IncomingMessage, JsonRpcError> {
    let Some(obj) = value.as_object() else {
        return Err(JsonRpcError::invalid_request(None));
    };
    let id = obj
        .get("id")
        .and_then(|raw| RequestId::deserialize(raw).ok());
    let has_method = obj.contains_key("method");

    if !has_method && (obj.contains_key("result") || obj.contains_key("error")) {
        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(JsonRpcError::invalid_request(id));
        }
        return Ok(IncomingMessage::Response(ClientResponse { id, body: value }));
    }

    if obj.contains_key("id") {
        let request = JsonRpcRequest::deserialize(&value).map_err(|_| JsonRpcError::invalid_request(id))?;
        if request.method.is_empty() {
            return Err(JsonRpcError::invalid_request_with(Some(request.id), "Empty method name"));
        }
        return Ok(IncomingMessage::Request(request));
    }

    JsonRpcNotification::deserialize(&value)
        .map(IncomingMessage::Notification)
        .map_err(|_| JsonRpcError::invalid_request(None))
}

/// Name and version reported in `serverInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl ServerInfo {
    /// Builds server info.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self::new(SERVER_NAME, env!("CARGO_PKG_VERSION"))
    }
}

/// `clientInfo` from `initialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version, if sent.
    #[serde(default)]
    pub version: Option<String>,
}

/// `initialize` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Version the client asked for.
    pub protocol_version: String,
    /// Client capabilities; accepted and otherwise ignored.
    #[serde(default)]
    pub capabilities: Value,
    /// Who is connecting.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // skip_serializing_if passes a reference
const fn is_false(b: &bool) -> bool {
    !*b
}

/// Per-feature flags inside `capabilities`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListCapability {
    /// Whether `list_changed` notifications are sent.
    #[serde(rename = "listChanged", skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// The `capabilities` object of the `initialize` result. Only kinds with at
/// least one registered capability are present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    /// Present when tools exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListCapability>,
    /// Present when resources exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ListCapability>,
    /// Present when prompts exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListCapability>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Tool name.
    pub name: String,
    /// Tool input.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// `prompts/get` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptGetParams {
    /// Prompt name.
    pub name: String,
    /// Prompt arguments.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// `resources/read` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceReadParams {
    /// Concrete resource URI.
    pub uri: String,
}

/// `notifications/cancelled` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// Request to cancel.
    pub request_id: RequestId,
    /// Why, if the client said.
    #[serde(default)]
    pub reason: Option<String>,
}

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
}

/// The `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Human-readable output.
    pub content: Vec<ToolContent>,
    /// Machine-readable output, when the handler returned a structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Set when the tool itself failed.
    #[serde(skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// A text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            structured_content: None,
            is_error: false,
        }
    }

    /// A tool failure reported in-band.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(message)
        }
    }

    /// Adds `structuredContent`.
    #[must_use]
    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured_content = Some(value);
        self
    }
}

/// Version to answer `initialize` with: the client's if supported, else the
/// newest.
#[must_use]
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or(MCP_PROTOCOL_VERSION)
}
