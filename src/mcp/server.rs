//! The server: a registry plus everything needed to expose it.
//!
//! A [`Server`] owns nothing transport-specific. It either runs one adapter
//! until shutdown ([`Server::run`]), or builds a mountable [`McpApp`] for a
//! host application ([`Server::build_app`]).
//!
//! # Example
//!
//! ```no_run
//! use mcp_host::mcp::capability::ToolDefinition;
//! use mcp_host::mcp::server::Server;
//! use mcp_host::mcp::transport::{TransportBinding, TransportKind};
//! use serde_json::json;
//!
//! let server = Server::new();
//! server
//!     .registry()
//!     .register_tool(ToolDefinition::new("add", "Add two numbers"), |args, _ctx| async move {
//!         let a = args["a"].as_i64().unwrap_or_default();
//!         let b = args["b"].as_i64().unwrap_or_default();
//!         Ok(json!(a + b))
//!     })?;
//!
//! server.run_blocking(TransportKind::Stdio, &TransportBinding::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::future::Future;
use std::sync::Arc;

use axum::handler::Handler;
use axum::http::Method;
use axum::routing::{on, MethodFilter, MethodRouter};
use indexmap::IndexMap;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::mcp::host::{Lifespan, McpApp};
use crate::mcp::manager::{ManagerSlot, SessionManager};
use crate::mcp::protocol::ServerInfo;
use crate::mcp::registry::Registry;
use crate::mcp::session::{DrainReport, SessionOptions};
use crate::mcp::transport::stdio::{serve_stdio, StdioTransport};
use crate::mcp::transport::{shutdown_signal, sse, streamable_http, TransportBinding, TransportKind};

/// An auxiliary route served next to the protocol endpoint.
#[derive(Debug)]
struct CustomRoute {
    methods: Vec<Method>,
    handler: MethodRouter,
}

/// An MCP server instance.
#[derive(Debug)]
pub struct Server {
    registry: Arc<Registry>,
    info: ServerInfo,
    session_options: SessionOptions,
    routes: IndexMap<String, CustomRoute>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Creates a server around an existing registry.
    #[must_use]
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            info: ServerInfo::default(),
            session_options: SessionOptions::default(),
            routes: IndexMap::new(),
        }
    }

    /// Sets the name and version reported by `initialize`.
    #[must_use]
    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Sets the options applied to every session.
    #[must_use]
    pub const fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    /// The capability registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Server name and version.
    #[must_use]
    pub const fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Session options.
    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        self.session_options
    }

    /// Creates a fresh session manager for one transport instance.
    #[must_use]
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(Arc::clone(&self.registry), self.info.clone(), self.session_options)
    }

    /// Registers an auxiliary HTTP handler served by every app this server
    /// builds. Responses are opaque to the protocol layer.
    ///
    /// Several calls may share a path as long as their methods differ.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRoute`] if `path` does not start with
    /// `/`, `methods` is empty or names an unroutable method, or a method is
    /// already routed on `path`.
    pub fn add_route<H, T>(&mut self, path: &str, methods: &[Method], handler: H) -> Result<&mut Self, ServerError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        if !path.starts_with('/') {
            return Err(ServerError::invalid_route(path, "path must start with '/'"));
        }

        let mut filter: Option<MethodFilter> = None;
        for method in methods {
            let one = MethodFilter::try_from(method.clone())
                .map_err(|e| ServerError::invalid_route(path, e.to_string()))?;
            filter = Some(filter.map_or(one, |f| f.or(one)));
        }
        let Some(filter) = filter else {
            return Err(ServerError::invalid_route(path, "at least one method is required"));
        };

        if let Some(existing) = self.routes.get(path) {
            if let Some(method) = methods.iter().find(|m| existing.methods.contains(m)) {
                return Err(ServerError::invalid_route(
                    path,
                    format!("{method} is already routed"),
                ));
            }
        }

        let handler = on(filter, handler);
        match self.routes.get_mut(path) {
            Some(existing) => {
                existing.methods.extend_from_slice(methods);
                existing.handler = existing.handler.clone().merge(handler);
            }
            None => {
                self.routes.insert(
                    path.to_string(),
                    CustomRoute {
                        methods: methods.to_vec(),
                        handler,
                    },
                );
            }
        }
        tracing::debug!(path, methods = ?methods, "Custom route registered");
        Ok(self)
    }

    /// Builds a mountable app for an HTTP transport with its endpoint at
    /// `path`. Nothing is bound or started.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotMountable`] for stdio and
    /// [`ServerError::InvalidRoute`] for bad or conflicting paths.
    pub fn build_app(&self, transport: TransportKind, path: &str) -> Result<McpApp, ServerError> {
        let binding = TransportBinding {
            path: path.to_string(),
            ..TransportBinding::for_transport(transport)
        };
        self.build_app_with(transport, &binding)
    }

    /// Like [`build_app`](Self::build_app), taking every path from `binding`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotMountable`] for stdio and
    /// [`ServerError::InvalidRoute`] for bad or conflicting paths.
    pub fn build_app_with(&self, transport: TransportKind, binding: &TransportBinding) -> Result<McpApp, ServerError> {
        let endpoints = match transport {
            TransportKind::Stdio => return Err(ServerError::NotMountable(transport)),
            TransportKind::StreamableHttp => vec![binding.path.as_str()],
            TransportKind::Sse => vec![binding.path.as_str(), binding.message_path.as_str()],
        };
        for endpoint in &endpoints {
            if !endpoint.starts_with('/') {
                return Err(ServerError::invalid_route(endpoint, "path must start with '/'"));
            }
        }
        if transport == TransportKind::Sse && binding.path == binding.message_path {
            return Err(ServerError::invalid_route(
                &binding.message_path,
                "the SSE stream and message paths must differ",
            ));
        }

        let slot = ManagerSlot::new(&binding.path);
        let mut router = match transport {
            TransportKind::Sse => sse::router(slot.clone(), &binding.path, &binding.message_path),
            TransportKind::Stdio | TransportKind::StreamableHttp => {
                streamable_http::router(slot.clone(), &binding.path)
            }
        };

        for (path, route) in &self.routes {
            if endpoints.contains(&path.as_str()) {
                return Err(ServerError::invalid_route(
                    path,
                    "conflicts with the protocol endpoint",
                ));
            }
            router = router.route(path, route.handler.clone());
        }

        let manager = Arc::new(self.session_manager());
        tracing::debug!(transport = %transport, path = %binding.path, "Built MCP app");
        Ok(McpApp::new(
            router.layer(TraceLayer::new_for_http()),
            Lifespan::new(slot, manager),
        ))
    }

    /// Serves `transport` until EOF (stdio) or SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the app cannot be built or the listener cannot
    /// be bound.
    pub async fn run(&self, transport: TransportKind, binding: &TransportBinding) -> Result<DrainReport, ServerError> {
        self.run_until(transport, binding, shutdown_signal()).await
    }

    /// Like [`run`](Self::run), stopping when `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the app cannot be built or the listener cannot
    /// be bound.
    pub async fn run_until<F>(
        &self,
        transport: TransportKind,
        binding: &TransportBinding,
        shutdown: F,
    ) -> Result<DrainReport, ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if transport == TransportKind::Stdio {
            let manager = self.session_manager();
            self.registry.server_started();
            tracing::info!(tools = self.registry.snapshot().len(), "Serving MCP over stdio");
            return Ok(serve_stdio(&manager, StdioTransport::new(), shutdown).await);
        }

        let app = self.build_app_with(transport, binding)?;
        let addr = binding.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::bind(&addr, e))?;
        tracing::info!(transport = %transport, path = %binding.path, "Serving MCP over HTTP");

        app.start()?.serve(listener, shutdown).await
    }

    /// Runs [`run`](Self::run) on a current-thread runtime, blocking the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created or the server fails.
    pub fn run_blocking(&self, transport: TransportKind, binding: &TransportBinding) -> Result<DrainReport, ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(transport, binding))
    }
}
