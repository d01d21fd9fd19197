//! Typed view of the JSON configuration file.
//!
//! Each section has serde defaults, so any subset of keys is a valid file.
//! Unknown keys are rejected.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::registry::{LateRegistration, RegistryOptions};
use crate::mcp::session::{
    SessionOptions, DEFAULT_CANCEL_GRACE, DEFAULT_DRAIN_GRACE, DEFAULT_OUTBOUND_BUFFER,
};
use crate::mcp::transport::{
    TransportBinding, TransportKind, DEFAULT_HOST, DEFAULT_MESSAGE_PATH, DEFAULT_PORT,
    DEFAULT_SSE_PATH, DEFAULT_STREAMABLE_HTTP_PATH,
};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// The whole configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Editor hint; ignored.
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Free-form note; ignored.
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Transport settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Checks values serde cannot: path shapes, buffer size, log level.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;

        if self.session.outbound_buffer == 0 {
            return Err(invalid("session.outbound_buffer must be greater than zero"));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// `transport` section.
///
/// `path` defaults per transport: `/mcp` for streamable HTTP, `/sse` for SSE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Which transport to serve.
    #[serde(default)]
    pub kind: TransportKind,

    /// Listen host for HTTP transports.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port for HTTP transports.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Protocol endpoint or SSE stream path.
    #[serde(default)]
    pub path: Option<String>,

    /// SSE message-post path.
    #[serde(default = "default_message_path")]
    pub message_path: String,
}

impl TransportConfig {
    /// Endpoint path, falling back to the transport's default.
    #[must_use]
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(match self.kind {
            TransportKind::Sse => DEFAULT_SSE_PATH,
            TransportKind::Stdio | TransportKind::StreamableHttp => DEFAULT_STREAMABLE_HTTP_PATH,
        })
    }

    /// The listen binding described by this section.
    #[must_use]
    pub fn binding(&self) -> TransportBinding {
        TransportBinding {
            host: self.host.clone(),
            port: self.port,
            path: self.path().to_string(),
            message_path: self.message_path.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("transport.host must not be empty"));
        }
        let paths = [
            ("transport.path", self.path()),
            ("transport.message_path", self.message_path.as_str()),
        ];
        for (name, path) in paths {
            if !path.starts_with('/') {
                return Err(invalid(format!("{name} '{path}' must start with '/'")));
            }
        }
        if self.kind == TransportKind::Sse && self.path() == self.message_path {
            return Err(invalid(
                "transport.path and transport.message_path must differ for the SSE transport",
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: default_host(),
            port: default_port(),
            path: None,
            message_path: default_message_path(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_message_path() -> String {
    DEFAULT_MESSAGE_PATH.to_string()
}

/// `session` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// How long a closing session waits for in-flight requests, in ms.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// How long a cancelled request waits for its handler, in ms.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Capacity of each session's outbound queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl SessionConfig {
    /// Converts to runtime session options.
    #[must_use]
    pub const fn options(&self) -> SessionOptions {
        SessionOptions {
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            outbound_buffer: self.outbound_buffer,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: default_drain_grace_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // the defaults are a few seconds
const fn default_drain_grace_ms() -> u64 {
    DEFAULT_DRAIN_GRACE.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn default_cancel_grace_ms() -> u64 {
    DEFAULT_CANCEL_GRACE.as_millis() as u64
}

const fn default_outbound_buffer() -> usize {
    DEFAULT_OUTBOUND_BUFFER
}

/// `registry` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Reject duplicate registrations instead of replacing them.
    #[serde(default)]
    pub strict: bool,

    /// Whether capabilities may be registered once serving has started.
    #[serde(default)]
    pub late_registration: LateRegistration,
}

impl RegistryConfig {
    /// Converts to runtime registry options.
    #[must_use]
    pub const fn options(&self) -> RegistryOptions {
        RegistryOptions {
            strict: self.strict,
            late_registration: self.late_registration,
        }
    }
}

/// `logging` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
