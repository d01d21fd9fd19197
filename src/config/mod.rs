//! Where configuration comes from.
//!
//! A JSON file is optional. Lookup:
//!
//! 1. the `CONFIG_FILE` argument, which must exist;
//! 2. `config.json` in the per-user directory (`~/.mcp-host/`, or
//!    `%USERPROFILE%\.mcp-host\` on Windows), read only if present.
//!
//! Without a file the built-in defaults apply. Command-line flags are layered
//! on top by the binary. `config/example-config.json` lists every key.

mod settings;

pub use settings::{Config, LoggingConfig, RegistryConfig, SessionConfig, TransportConfig};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Per-user directory holding `config.json`.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-host"))
}

/// `config.json` inside [`default_config_dir`].
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Reads, parses and validates the configuration.
///
/// With `path` set the file must exist. Without it the per-user file is used
/// when present and [`Config::default`] otherwise.
///
/// # Errors
///
/// [`ConfigError::NotFound`] for a missing explicit file, `ReadError` and
/// `ParseError` for unreadable or malformed JSON (unknown keys included), and
/// `ValidationError` for values out of range.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let source = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::NotFound { path: p.to_path_buf() });
            }
            p.to_path_buf()
        }
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Config::default()),
        },
    };

    tracing::debug!(path = %source.display(), "Loading configuration");
    let text = std::fs::read_to_string(&source).map_err(|e| ConfigError::ReadError {
        path: source.clone(),
        source: e,
    })?;
    let config: Config = serde_json::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: source.clone(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}
