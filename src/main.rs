//! mcp-host: serve MCP capabilities over stdio, streamable HTTP or SSE
//!
//! The binary registers a set of demo capabilities and serves them on the
//! configured transport until EOF or a shutdown signal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::http::Method;
use axum::Json;
use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_host::config::{self, Config};
use mcp_host::demo::register_demo_capabilities;
use mcp_host::mcp::registry::Registry;
use mcp_host::mcp::server::Server;
use mcp_host::mcp::transport::TransportKind;

/// Transport-agnostic MCP server.
///
/// Serves tools, resources and prompts over stdio, streamable HTTP or
/// legacy SSE.
#[derive(Parser, Debug)]
#[command(name = "mcp-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults to ~/.mcp-host/config.json if present)
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Transport to serve
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Listen host for HTTP transports
    #[arg(long)]
    host: Option<String>,

    /// Listen port for HTTP transports
    #[arg(long)]
    port: Option<u16>,

    /// Protocol endpoint (streamable HTTP) or event-stream path (SSE)
    #[arg(long)]
    path: Option<String>,

    /// Message-post path for the SSE transport
    #[arg(long)]
    message_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// More logging: -v info, -vv debug, -vvv trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, cfg: &mut Config) {
        if let Some(kind) = self.transport {
            cfg.transport.kind = kind;
        }
        if let Some(host) = &self.host {
            cfg.transport.host.clone_from(host);
        }
        if let Some(port) = self.port {
            cfg.transport.port = port;
        }
        if let Some(path) = &self.path {
            cfg.transport.path = Some(path.clone());
        }
        if let Some(message_path) = &self.message_path {
            cfg.transport.message_path.clone_from(message_path);
        }
        if let Some(level) = &self.log_level {
            cfg.logging.level.clone_from(level);
        }
    }

    /// Level chosen by `-q`/`-v`, falling back to the configured one.
    fn verbosity(&self, configured: &str) -> Level {
        if self.quiet {
            return Level::ERROR;
        }
        match self.verbose {
            0 => configured.parse().unwrap_or(Level::WARN),
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` directives refine `level`.
///
/// Everything goes to stderr so stdout stays clean for the stdio transport.
fn init_tracing(level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Entry point for the mcp-host server.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut cfg);
    if let Err(e) = cfg.validate() {
        eprintln!("Configuration error: {e}");
        if config_path.is_none() {
            if let Some(default_path) = config::default_config_path() {
                eprintln!("\nDefault config location: {}", default_path.display());
                eprintln!("See config/example-config.json for every option");
            }
        }
        return ExitCode::FAILURE;
    }

    init_tracing(args.verbosity(&cfg.logging.level));

    // GPLv3 section 5d notice.
    eprintln!(
        "mcp-host {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!("Source: {}", env!("CARGO_PKG_REPOSITORY"));
    eprintln!();

    let transport = cfg.transport.kind;
    let binding = cfg.transport.binding();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = %transport,
        "Starting mcp-host server"
    );

    let registry = Arc::new(Registry::with_options(cfg.registry.options()));
    let mut server = Server::with_registry(registry).with_session_options(cfg.session.options());

    if let Err(e) = register_demo_capabilities(server.registry(), server.info()) {
        error!(error = %e, "Failed to register capabilities");
        return ExitCode::FAILURE;
    }
    if transport.is_http() {
        if let Err(e) = server.add_route("/health", &[Method::GET], health) {
            error!(error = %e, "Failed to add health route");
            return ExitCode::FAILURE;
        }
    }

    match server.run_blocking(transport, &binding) {
        Ok(report) => {
            info!(
                completed = report.completed,
                abandoned = report.abandoned,
                "Server shut down gracefully"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
