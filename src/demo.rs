//! Demo capabilities served by the `mcp-host` binary.
//!
//! They exercise every part of the protocol surface: plain tools, a
//! long-running cancellable tool with progress, a static resource, a
//! resource template and a prompt with arguments.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{HandlerError, RegistryError};
use crate::mcp::capability::{
    PromptArgument, PromptDefinition, RequestContext, ResourceDefinition, ToolDefinition,
};
use crate::mcp::protocol::{ServerInfo, MCP_PROTOCOL_VERSION};
use crate::mcp::registry::Registry;

/// Longest sleep the `sleep` tool accepts.
pub const MAX_SLEEP_SECONDS: f64 = 60.0;

const SLEEP_STEPS: u32 = 10;

/// Registers the demo tools, resources and prompt.
///
/// # Errors
///
/// Returns an error if a name is already taken in a strict registry, or the
/// registry is frozen.
pub fn register_demo_capabilities(registry: &Registry, info: &ServerInfo) -> Result<(), RegistryError> {
    registry.register_tool(
        ToolDefinition::new("add", "Add two integers").with_input_schema(json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer", "description": "First addend" },
                "b": { "type": "integer", "description": "Second addend" }
            },
            "required": ["a", "b"]
        })),
        |args, _ctx| async move { add(&args) },
    )?;

    registry.register_tool(
        ToolDefinition::new("echo", "Return the given text unchanged").with_input_schema(json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })),
        |args, _ctx| async move {
            let text = args["text"]
                .as_str()
                .ok_or_else(|| HandlerError::invalid_params("'text' must be a string"))?;
            Ok(Value::String(text.to_string()))
        },
    )?;

    registry.register_tool(
        ToolDefinition::new(
            "sleep",
            "Wait for the given number of seconds, reporting progress. Cancellable.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "seconds": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": MAX_SLEEP_SECONDS,
                    "description": "How long to wait"
                }
            },
            "required": ["seconds"]
        })),
        sleep,
    )?;

    let server_info = json!({
        "name": info.name,
        "version": info.version,
        "protocolVersion": MCP_PROTOCOL_VERSION,
    });
    registry.register_resource(
        ResourceDefinition::new("server://info", "Server information")
            .with_description("Name and version of this server")
            .with_mime_type("application/json"),
        move |_args, _ctx| {
            let server_info = server_info.clone();
            async move { Ok(server_info) }
        },
    )?;

    registry.register_resource(
        ResourceDefinition::new("greeting://{name}", "Personal greeting")
            .with_description("A greeting for the named person")
            .with_mime_type("text/plain"),
        |args, _ctx| async move {
            let name = args["name"]
                .as_str()
                .ok_or_else(|| HandlerError::invalid_params("missing template variable 'name'"))?;
            Ok(Value::String(format!("Hello, {name}!")))
        },
    )?;

    registry.register_prompt(
        PromptDefinition::new("code_review", "Ask for a review of a piece of code")
            .with_argument(PromptArgument::required("code", "The code to review"))
            .with_argument(PromptArgument::optional("language", "Programming language of the code")),
        |args, _ctx| async move { code_review(&args) },
    )?;

    tracing::debug!(capabilities = registry.snapshot().len(), "Registered demo capabilities");
    Ok(())
}

fn add(args: &Value) -> Result<Value, HandlerError> {
    let operand = |name: &str| {
        args[name]
            .as_i64()
            .ok_or_else(|| HandlerError::invalid_params(format!("'{name}' must be an integer")))
    };
    let (a, b) = (operand("a")?, operand("b")?);
    a.checked_add(b)
        .map(|sum| json!(sum))
        .ok_or_else(|| HandlerError::tool(format!("{a} + {b} overflows a 64-bit integer")))
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    seconds: f64,
}

async fn sleep(args: Value, ctx: RequestContext) -> Result<Value, HandlerError> {
    let SleepArgs { seconds } = serde_json::from_value(args)?;
    if !(0.0..=MAX_SLEEP_SECONDS).contains(&seconds) {
        return Err(HandlerError::invalid_params(format!(
            "'seconds' must be between 0 and {MAX_SLEEP_SECONDS}"
        )));
    }

    let step = Duration::from_secs_f64(seconds) / SLEEP_STEPS;
    for done in 1..=SLEEP_STEPS {
        tokio::select! {
            () = ctx.cancelled() => {
                tracing::debug!(request_id = %ctx.request_id(), done, "sleep cancelled");
                return Err(HandlerError::Cancelled);
            }
            () = tokio::time::sleep(step) => {}
        }
        ctx.report_progress(u64::from(done), Some(u64::from(SLEEP_STEPS)), None)
            .await;
    }

    Ok(Value::String(format!("Slept for {seconds} seconds")))
}

fn code_review(args: &Value) -> Result<Value, HandlerError> {
    let code = args["code"]
        .as_str()
        .ok_or_else(|| HandlerError::invalid_params("'code' must be a string"))?;
    let text = match args["language"].as_str() {
        Some(language) => format!(
            "Please review this {language} code. Point out bugs, unclear names and missing tests.\n\n```{language}\n{code}\n```"
        ),
        None => format!(
            "Please review this code. Point out bugs, unclear names and missing tests.\n\n```\n{code}\n```"
        ),
    };
    Ok(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::capability::CapabilityKind;
    use crate::mcp::protocol::RequestId;

    fn registry() -> Registry {
        let registry = Registry::new();
        register_demo_capabilities(&registry, &ServerInfo::default()).unwrap();
        registry
    }

    #[test]
    fn registers_everything() {
        let registry = registry();
        let names = |kind| {
            registry
                .list(kind)
                .iter()
                .map(|m| m.key().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(CapabilityKind::Tool), ["add", "echo", "sleep"]);
        assert_eq!(names(CapabilityKind::Resource), ["server://info", "greeting://{name}"]);
        assert_eq!(names(CapabilityKind::Prompt), ["code_review"]);
    }

    #[test]
    fn add_checks_operands() {
        assert_eq!(add(&json!({"a": 2, "b": 3})).unwrap(), json!(5));
        assert!(matches!(
            add(&json!({"a": "2", "b": 3})),
            Err(HandlerError::InvalidParams(_))
        ));
        assert!(matches!(
            add(&json!({"a": i64::MAX, "b": 1})),
            Err(HandlerError::Tool(_))
        ));
    }

    #[tokio::test]
    async fn greeting_uses_template_variable() {
        let registry = registry();
        let capability = registry.lookup(CapabilityKind::Resource, "greeting://{name}").unwrap();
        let result = capability
            .invoke(
                json!({"uri": "greeting://Ada", "name": "Ada"}),
                RequestContext::detached(RequestId::Number(1)),
            )
            .await
            .unwrap();
        assert_eq!(result, json!("Hello, Ada!"));
    }

    #[tokio::test]
    async fn sleep_stops_when_cancelled() {
        let ctx = RequestContext::detached(RequestId::Number(1));
        ctx.cancellation_token().cancel();
        let result = sleep(json!({"seconds": 30}), ctx).await;
        assert!(matches!(result, Err(HandlerError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_rejects_out_of_range() {
        let ctx = RequestContext::detached(RequestId::Number(1));
        let result = sleep(json!({"seconds": 3600}), ctx).await;
        assert!(matches!(result, Err(HandlerError::InvalidParams(_))));
    }

    #[test]
    fn code_review_mentions_language() {
        let text = code_review(&json!({"code": "fn main() {}", "language": "rust"})).unwrap();
        assert!(text.as_str().unwrap().contains("```rust"));
        assert!(code_review(&json!({})).is_err());
    }
}
