//! Keylock - distributed per-key lock server and command runner
//!
//! `keylock serve` runs the lock server; `keylock exec` runs a command while holding a
//! key on it.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod shutdown;

pub use config::{load_config, KeylockConfig};
