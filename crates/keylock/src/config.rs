//! Configuration loading from files and environment
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. TOML file: `--config <FILE>`, else `<config dir>/keylock/config.toml` if present
//! 3. Environment variables: `KEYLOCK_*`
//! 4. Command-line flags (applied by the handlers)
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 7420
//! socket_timeout_secs = 30
//! log_dir = "/var/log/keylock"
//!
//! [client]
//! host = "locks.internal"
//! port = 7420
//! reconnect_delay_ms = 1000
//! ```

use std::path::{Path, PathBuf};

use keylock_core::{ClientConfig, Error, ServerConfig};
use serde::Deserialize;

/// Everything the binary can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeylockConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Load configuration from defaults, file and environment
///
/// An explicit `path` must exist; the default location is optional.
///
/// # Errors
///
/// Returns error if:
/// - The config file cannot be read or is malformed TOML
/// - A `KEYLOCK_*` variable does not parse
pub fn load_config(path: Option<&Path>) -> Result<KeylockConfig, Error> {
    let config = match path {
        Some(path) => load_toml_file(path)?,
        None => match default_config_path() {
            Some(path) if path.is_file() => load_toml_file(&path)?,
            _ => KeylockConfig::default(),
        },
    };
    config.apply_env_vars()
}

/// `<config dir>/keylock/config.toml` for the current user
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "keylock")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Parse a TOML config file
///
/// # Errors
///
/// Returns `Io` if the file cannot be read and `Parse` if it is not valid TOML.
pub fn load_toml_file(path: &Path) -> Result<KeylockConfig, Error> {
    if path.is_dir() {
        return Err(Error::Io(format!(
            "Config path is a directory, not a file: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("Failed to read config file {}: {e}", path.display())))?;
    toml::from_str(&content)
        .map_err(|e| Error::Parse(format!("Failed to parse config file {}: {e}", path.display())))
}

impl KeylockConfig {
    /// Apply `KEYLOCK_*` overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a numeric variable does not parse
    pub fn apply_env_vars(self) -> Result<Self, Error> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply `KEYLOCK_*` overrides read through `lookup`
    ///
    /// `KEYLOCK_HOST`, `KEYLOCK_PORT` and `KEYLOCK_SOCKET_TIMEOUT` apply to both the
    /// server and client sections.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a numeric variable does not parse
    pub fn apply_env_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        if let Some(host) = lookup("KEYLOCK_HOST") {
            self.server.host.clone_from(&host);
            self.client.host = host;
        }
        if let Some(port) = parse_var(&lookup, "KEYLOCK_PORT")? {
            self.server.port = port;
            self.client.port = port;
        }
        if let Some(secs) = parse_var(&lookup, "KEYLOCK_SOCKET_TIMEOUT")? {
            self.server.socket_timeout_secs = secs;
            self.client.socket_timeout_secs = secs;
        }
        if let Some(dir) = lookup("KEYLOCK_LOG_DIR") {
            self.server.log_dir = Some(dir);
        }
        if let Some(ms) = parse_var(&lookup, "KEYLOCK_RECONNECT_DELAY_MS")? {
            self.client.reconnect_delay_ms = ms;
        }
        Ok(self)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("Invalid {name} value '{value}': {e}")))
        })
        .transpose()
}
