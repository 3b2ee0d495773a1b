//! Keylock core - distributed per-key locking
//!
//! This crate provides:
//! - The wire protocol (`aquire`, `toDo`, `done`, `updateTaskSocket`) and its framing
//! - A per-key FIFO admission queue and a tick-driven timeout wheel
//! - The lock server session and its TCP listener
//! - The lock client with reconnect recovery

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;
pub mod wheel;

pub use client::{ClientEvent, LockClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{LockKey, TaskId, DEFAULT_LOCK_TIMEOUT_SECS, SERVER_GRACE_SECS};
pub use queue::{Admission, Enqueued, KeyQueue, Ticket};
pub use server::{LockServer, ServerHandle, ServerLifecycle, ServerSession, SessionStats};
pub use wheel::{Tick, TickHandle, Ticker, TimeoutWheel};
