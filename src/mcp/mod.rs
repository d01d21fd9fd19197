//! Model Context Protocol (MCP) server core.
//!
//! Capabilities are registered once and served over any transport. The
//! layers, from the wire inwards:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  transport::{stdio, streamable_http, sse}   host::HostApp    │
//! │          │ raw frames                │ lifespans              │
//! │          ▼                           ▼                        │
//! │   ┌─────────────┐   owns    ┌────────────────┐                │
//! │   │   Session   │◀──────────│ SessionManager │                │
//! │   └─────────────┘           └────────────────┘                │
//! │          │ dispatch against a snapshot                        │
//! │          ▼                                                    │
//! │   ┌─────────────┐                                             │
//! │   │  Registry   │  tools, resources, prompts                  │
//! │   └─────────────┘                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! Targets MCP 2025-03-26 and negotiates down to 2024-11-05.

pub mod capability;
pub mod host;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod uri_template;

pub use capability::{
    Capability, CapabilityKind, PromptArgument, PromptDefinition, RequestContext, ResourceDefinition,
    ToolDefinition,
};
pub use host::{HostApp, IntoMount, Lifespan, McpApp, RunningHost};
pub use manager::SessionManager;
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServerInfo, MCP_PROTOCOL_VERSION};
pub use registry::{LateRegistration, Registry, RegistryOptions};
pub use server::Server;
pub use session::{DrainReport, Session, SessionOptions, SessionState};
pub use transport::{TransportBinding, TransportKind};
