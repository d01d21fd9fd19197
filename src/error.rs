//! Error types for mcp-host.
//!
//! Errors are split by the layer that raises them:
//!
//! - [`ConfigError`]: loading and validating the configuration file
//! - [`RegistryError`]: registering and looking up capabilities
//! - [`HandlerError`]: faults raised by capability handlers
//! - [`ServerError`]: running transports and integrating with a host
//!
//! Handler and registry errors never reach a transport directly. The session
//! converts them into JSON-RPC error responses correlated to the request.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::mcp::capability::CapabilityKind;
use crate::mcp::transport::TransportKind;

/// Why a configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but reading it failed.
    #[error("cannot read {path}")]
    ReadError {
        /// File that was being read.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON, or has unknown or mistyped keys.
    #[error("cannot parse {path}")]
    ParseError {
        /// File that was being parsed.
        path: PathBuf,
        /// serde failure, with line and column.
        #[source]
        source: serde_json::Error,
    },

    /// An explicitly named file does not exist.
    #[error("no configuration file at {path}")]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// A value parsed but is unusable.
    #[error("invalid configuration: {message}")]
    ValidationError {
        /// Which key is wrong, and how.
        message: String,
    },
}

/// Errors raised by the capability registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A capability with the same kind and key already exists (strict mode only).
    #[error("{kind} '{key}' is already registered")]
    Duplicate {
        /// Kind of the conflicting capability.
        kind: CapabilityKind,
        /// Name or URI template of the conflicting capability.
        key: String,
    },

    /// No capability is registered under the given kind and key.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Kind that was looked up.
        kind: CapabilityKind,
        /// Name or URI that was looked up.
        key: String,
    },

    /// The registry was frozen when the server started.
    #[error("cannot register {kind} '{key}': registration is closed once the server is running")]
    Frozen {
        /// Kind of the rejected capability.
        kind: CapabilityKind,
        /// Name or URI template of the rejected capability.
        key: String,
    },

    /// A resource URI template could not be compiled.
    #[error("invalid URI template '{template}': {reason}")]
    InvalidUriTemplate {
        /// The offending template.
        template: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors returned by capability handlers.
///
/// The variant decides how the session reports the failure to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The arguments were unusable. Reported as JSON-RPC `-32602`.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The tool ran and failed. Reported as a successful response with
    /// `isError: true` so the model can see the failure text.
    #[error("{0}")]
    Tool(String),

    /// Anything else. Reported as JSON-RPC `-32603`.
    #[error("internal error: {0}")]
    Internal(String),

    /// The handler observed its cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Shorthand for [`HandlerError::InvalidParams`].
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Shorthand for [`HandlerError::Tool`].
    #[must_use]
    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool(message.into())
    }

    /// Shorthand for [`HandlerError::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParams(error.to_string())
    }
}

/// Errors raised while running a transport or integrating with a host.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Transport I/O failed.
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    /// The HTTP listener could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A custom route could not be added.
    #[error("invalid route '{path}': {reason}")]
    InvalidRoute {
        /// The requested path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The transport has no HTTP application object to mount.
    #[error("the {0} transport cannot be mounted into a host application")]
    NotMountable(TransportKind),

    /// A request reached a mounted app whose lifespan was never started.
    ///
    /// This is the usual symptom of mounting the router into a host without
    /// handing its [`Lifespan`](crate::mcp::host::Lifespan) to the outermost
    /// application.
    #[error(
        "session manager for '{mount}' is not initialised: its lifespan was not started by the \
         outermost host application"
    )]
    LifespanNotStarted {
        /// Mount path of the app.
        mount: String,
    },

    /// A lifespan was started twice.
    #[error("lifespan for '{mount}' was already started")]
    LifespanAlreadyStarted {
        /// Mount path of the app.
        mount: String,
    },

    /// Registry failure while preparing the server.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Configuration failure while preparing the server.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServerError {
    /// Builds a bind error for the given listen address.
    #[must_use]
    pub fn bind(addr: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Builds an invalid route error.
    #[must_use]
    pub fn invalid_route(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRoute {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
