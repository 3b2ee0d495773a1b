//! `keylock exec`
//!
//! Runs a child process inside `LockClient::lock`. The child is killed if the lock
//! times out or the runner is interrupted.

use std::process::ExitStatus;

use anyhow::{Context, Result};
use keylock_core::{ClientConfig, LockClient, LockKey};
use tokio::process::Command;

use crate::shutdown;

/// Exec command options
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub key: LockKey,
    pub timeout_secs: u64,
    pub program: String,
    pub args: Vec<String>,
}

/// Run the command while holding the key; returns the exit code to use.
///
/// # Errors
///
/// Returns error if the client config is invalid, the lock times out, the command
/// cannot be spawned or the runner is interrupted.
pub async fn run(options: &ExecOptions, config: &ClientConfig) -> Result<i32> {
    let client = LockClient::connect(config)?;
    let signals = shutdown::signal_channel()?;

    let outcome = tokio::select! {
        outcome = client.lock(options.key.clone(), options.timeout_secs, || run_child(options)) => outcome,
        () = shutdown::wait(signals) => Err(anyhow::anyhow!("Interrupted while holding '{}'", options.key)),
    };
    client.close().await;

    let status = outcome?;
    tracing::debug!(key = %options.key, %status, "command finished");
    Ok(exit_code(status))
}

async fn run_child(options: &ExecOptions) -> Result<ExitStatus> {
    tracing::info!(key = %options.key, program = %options.program, "lock held, running command");
    Command::new(&options.program)
        .args(&options.args)
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("Failed to run '{}'", options.program))
}

/// Child exit code, or 128 + signal number when it was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
