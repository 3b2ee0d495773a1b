//! SIGINT/SIGTERM handling.

use anyhow::{Context, Result};
use tokio::sync::broadcast;

/// Shutdown signal delivered to long-running commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Subscribe to process shutdown signals.
///
/// Every receiver gets the first SIGINT or SIGTERM (Ctrl-C on non-Unix).
///
/// # Errors
///
/// Returns error if the signal handlers cannot be installed.
pub fn signal_channel() -> Result<broadcast::Receiver<ShutdownSignal>> {
    let (tx, rx) = broadcast::channel(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM")?;

        tokio::spawn(async move {
            let received = tokio::select! {
                _ = sigint.recv() => ShutdownSignal::Interrupt,
                _ = sigterm.recv() => ShutdownSignal::Terminate,
            };
            tracing::info!(signal = ?received, "shutdown requested");
            let _ = tx.send(received);
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C");
                let _ = tx.send(ShutdownSignal::Interrupt);
            }
        });
    }

    Ok(rx)
}

/// Resolve once `signals` delivers (or its sender is gone).
pub async fn wait(mut signals: broadcast::Receiver<ShutdownSignal>) {
    let _ = signals.recv().await;
}
