//! mcp-host: a transport-agnostic Model Context Protocol server core
//!
//! Register tools, resources and prompts once; serve them over stdio,
//! streamable HTTP or legacy SSE, or mount them into a larger axum
//! application.
//!
//! # Architecture
//!
//! - **Registry**: capabilities keyed by kind and name, snapshotted per session
//! - **Session**: one client connection with its own lifecycle, in-flight
//!   requests and cooperative cancellation
//! - **Transports**: thin adapters turning frames into session calls
//! - **Host shim**: mountable apps whose lifespans are started by the root
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`demo`]: Demo capabilities served by the binary
//! - [`error`]: Error types
//! - [`mcp`]: MCP protocol, sessions, transports and host integration

pub mod config;
pub mod demo;
pub mod error;
pub mod mcp;
