//! Error types for keylock-core
//!
//! Lock-layer failures are grouped the way callers handle them:
//! - `LockTimeout`: returned to the specific caller of `lock()`
//! - `Protocol` / `Transport`: logged at session level, never abort unrelated locks
//! - `InvalidConfig` / `Parse` / `Io`: setup problems surfaced before anything runs
//!
//! Errors raised by the user's critical-section work are not wrapped here.
//! `LockClient::lock` hands them back unchanged.

use thiserror::Error;

/// Core error type for lock operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// No admission (or no completion) within the caller's declared window
    #[error("Lock timeout: key '{key}' not completed within {timeout_secs}s")]
    LockTimeout { key: String, timeout_secs: u64 },

    /// Unrecognized command or malformed payload on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection lost, refused or framing failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The client session driver is gone (client dropped or runtime shutting down)
    #[error("Lock session closed")]
    SessionClosed,

    /// Invalid configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration or payload could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO failure outside of an established connection (bind, file access)
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Create a lock timeout error for `key`.
    pub fn lock_timeout(key: impl Into<String>, timeout_secs: u64) -> Self {
        Self::LockTimeout {
            key: key.into(),
            timeout_secs,
        }
    }

    /// Check whether this error is a lock timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Returns the process exit code for this error.
    ///
    /// - 1: configuration or parse problems
    /// - 2: transport, protocol and IO failures
    /// - 3: lock timeout
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) | Self::Parse(_) => 1,
            Self::Protocol(_) | Self::Transport(_) | Self::SessionClosed | Self::Io(_) => 2,
            Self::LockTimeout { .. } => 3,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type alias for keylock-core operations
pub type Result<T> = std::result::Result<T, Error>;
