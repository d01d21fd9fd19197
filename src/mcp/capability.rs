//! Capabilities: the tools, resources and prompts a server exposes.
//!
//! A [`Capability`] pairs the metadata clients discover (a
//! [`ToolDefinition`], [`ResourceDefinition`] or [`PromptDefinition`]) with an
//! async handler. Handlers are plain closures:
//!
//! ```ignore
//! registry.register_tool(
//!     ToolDefinition::new("add", "Add two integers").with_input_schema(schema),
//!     |args, _ctx| async move {
//!         let a = args["a"].as_i64().ok_or_else(|| HandlerError::invalid_params("a"))?;
//!         let b = args["b"].as_i64().ok_or_else(|| HandlerError::invalid_params("b"))?;
//!         Ok(json!(a + b))
//!     },
//! )?;
//! ```
//!
//! # Cancellation contract
//!
//! Cancellation is cooperative. Each invocation receives a [`RequestContext`]
//! whose token fires when the client cancels the request or the session
//! closes. Long-running handlers must check [`RequestContext::is_cancelled`]
//! or await [`RequestContext::cancelled`] at safe points. A handler that never
//! looks at the token keeps running after the client has been told the
//! request was cancelled; its result is discarded.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, RegistryError};
use crate::mcp::protocol::{OutgoingNotification, RequestId};
use crate::mcp::session::Envelope;
use crate::mcp::uri_template::UriTemplate;

/// The three kinds of capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// A callable tool.
    Tool,
    /// A readable resource, addressed by URI or URI template.
    Resource,
    /// A prompt template.
    Prompt,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        })
    }
}

/// A tool definition for tools/list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Creates a tool that takes an empty object.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    /// Replaces the input schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Returns the names listed under `required` in the input schema.
    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

/// A resource definition.
///
/// `uri` is either a concrete URI (`server://info`) or an RFC 6570 level-1
/// template (`greeting://{name}`). Templates are listed through
/// `resources/templates/list` instead of `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// URI or URI template.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDefinition {
    /// Creates a resource definition.
    #[must_use]
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Returns true if `uri` contains template variables.
    #[must_use]
    pub fn is_template(&self) -> bool {
        UriTemplate::is_template(&self.uri)
    }

    /// Renders the `resources/templates/list` form of this definition.
    #[must_use]
    pub fn as_template_json(&self) -> Value {
        let mut value = json!({ "uriTemplate": self.uri, "name": self.name });
        if let Some(description) = &self.description {
            value["description"] = json!(description);
        }
        if let Some(mime_type) = &self.mime_type {
            value["mimeType"] = json!(mime_type);
        }
        value
    }
}

/// One argument accepted by a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether `prompts/get` must supply it.
    #[serde(default)]
    pub required: bool,
}

impl PromptArgument {
    /// A required argument.
    #[must_use]
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            required: true,
        }
    }

    /// An optional argument.
    #[must_use]
    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            required: false,
        }
    }
}

/// A prompt definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDefinition {
    /// Unique prompt name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Arguments the prompt accepts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

impl PromptDefinition {
    /// Creates a prompt without arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            arguments: Vec::new(),
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_argument(mut self, argument: PromptArgument) -> Self {
        self.arguments.push(argument);
        self
    }
}

/// Metadata of any capability, as reported by discovery requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CapabilityMetadata {
    /// Tool metadata.
    Tool(ToolDefinition),
    /// Resource metadata.
    Resource(ResourceDefinition),
    /// Prompt metadata.
    Prompt(PromptDefinition),
}

impl CapabilityMetadata {
    /// Kind of the capability.
    #[must_use]
    pub const fn kind(&self) -> CapabilityKind {
        match self {
            Self::Tool(_) => CapabilityKind::Tool,
            Self::Resource(_) => CapabilityKind::Resource,
            Self::Prompt(_) => CapabilityKind::Prompt,
        }
    }

    /// Registry key: the tool or prompt name, or the resource URI (template).
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Tool(def) => &def.name,
            Self::Resource(def) => &def.uri,
            Self::Prompt(def) => &def.name,
        }
    }
}

/// Boxed future returned by every handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// Type-erased handler.
pub type HandlerFn = Arc<dyn Fn(Value, RequestContext) -> HandlerFuture + Send + Sync>;

/// A registered capability: metadata plus handler.
#[derive(Clone)]
pub struct Capability {
    metadata: CapabilityMetadata,
    handler: HandlerFn,
    template: Option<UriTemplate>,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn erase<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |args, ctx| -> HandlerFuture { Box::pin(handler(args, ctx)) })
}

impl Capability {
    /// Creates a tool capability.
    ///
    /// The handler receives the `arguments` object of `tools/call`.
    pub fn tool<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self {
            metadata: CapabilityMetadata::Tool(definition),
            handler: erase(handler),
            template: None,
        }
    }

    /// Creates a resource capability.
    ///
    /// The handler receives `{"uri": <requested uri>, ...template variables}`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidUriTemplate`] if the URI template is malformed.
    pub fn resource<F, Fut>(definition: ResourceDefinition, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let template = if definition.is_template() {
            Some(UriTemplate::compile(&definition.uri)?)
        } else {
            None
        };
        Ok(Self {
            metadata: CapabilityMetadata::Resource(definition),
            handler: erase(handler),
            template,
        })
    }

    /// Creates a prompt capability.
    ///
    /// The handler receives the `arguments` object of `prompts/get`.
    pub fn prompt<F, Fut>(definition: PromptDefinition, handler: F) -> Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self {
            metadata: CapabilityMetadata::Prompt(definition),
            handler: erase(handler),
            template: None,
        }
    }

    /// Kind of this capability.
    #[must_use]
    pub const fn kind(&self) -> CapabilityKind {
        self.metadata.kind()
    }

    /// Registry key of this capability.
    #[must_use]
    pub fn key(&self) -> &str {
        self.metadata.key()
    }

    /// Discovery metadata.
    #[must_use]
    pub const fn metadata(&self) -> &CapabilityMetadata {
        &self.metadata
    }

    /// Compiled URI template, for templated resources.
    #[must_use]
    pub const fn template(&self) -> Option<&UriTemplate> {
        self.template.as_ref()
    }

    /// Starts the handler. The returned future does nothing until polled.
    #[must_use]
    pub fn invoke(&self, arguments: Value, ctx: RequestContext) -> HandlerFuture {
        (self.handler)(arguments, ctx)
    }
}

/// Per-invocation context handed to handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    session_id: Arc<str>,
    cancellation: CancellationToken,
    progress: Option<ProgressReporter>,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        session_id: Arc<str>,
        cancellation: CancellationToken,
        progress: Option<ProgressReporter>,
    ) -> Self {
        Self {
            request_id,
            session_id,
            cancellation,
            progress,
        }
    }

    /// A context that is never cancelled and reports no progress.
    ///
    /// Useful for calling handlers directly in tests.
    #[must_use]
    pub fn detached(request_id: RequestId) -> Self {
        Self::new(request_id, Arc::from("detached"), CancellationToken::new(), None)
    }

    /// ID of the request being served.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// ID of the session the request arrived on.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns true once the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// The raw cancellation token, for use with `tokio::select!` or child tasks.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Sends a `notifications/progress` message if the client asked for progress.
    ///
    /// Returns `false` when the client supplied no progress token or the
    /// session is gone.
    pub async fn report_progress(&self, progress: u64, total: Option<u64>, message: Option<&str>) -> bool {
        match &self.progress {
            Some(reporter) => reporter.send(progress, total, message).await,
            None => false,
        }
    }
}

/// Sends progress notifications for one request.
#[derive(Debug, Clone)]
pub(crate) struct ProgressReporter {
    token: Value,
    request_id: RequestId,
    outbound: mpsc::Sender<Envelope>,
}

impl ProgressReporter {
    pub(crate) const fn new(token: Value, request_id: RequestId, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            token,
            request_id,
            outbound,
        }
    }

    async fn send(&self, progress: u64, total: Option<u64>, message: Option<&str>) -> bool {
        let notification = OutgoingNotification::progress(&self.token, progress, total, message);
        self.outbound
            .send(Envelope::related(notification.into(), self.request_id.clone()))
            .await
            .is_ok()
    }
}
