//! Server and client configuration
//!
//! Plain data holders with defaults. Loading from files and the environment lives in
//! the `keylock` binary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default socket idle timeout in seconds.
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 7420;

/// Lock server construction parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    /// Close a connection after this many seconds without a frame
    ///
    /// Peers heartbeat at least every `MAX_HEARTBEAT_INTERVAL` (10s); values at or below
    /// that reap clients configured with a much longer timeout than this server.
    pub socket_timeout_secs: u64,
    /// Directory for daily-rotated log files; stdout when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Bind address as `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty or the socket timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host cannot be empty".to_string()));
        }
        if self.socket_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "socket_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(dir) = &self.log_dir {
            if dir.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "log_dir cannot be empty - unset it to log to stdout".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Lock client construction parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Idle timeout for the server connection; heartbeats go out every third of it,
    /// capped at 10s, so the server's own timeout should stay above 10s.
    pub socket_timeout_secs: u64,
    /// Delay between reconnection attempts
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
            reconnect_delay_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Client config pointing at `host:port` with default timeouts
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty, the port is 0 or the socket timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig(
                "port must be set to the lock server's port".to_string(),
            ));
        }
        if self.socket_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "socket_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
