//! `keylock serve`

use anyhow::{Context, Result};
use keylock_core::{LockServer, ServerConfig, ServerLifecycle};

use crate::shutdown;

/// Run the lock server until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns error if the config is invalid, the address cannot be bound or signal
/// handlers cannot be installed.
pub async fn run(config: &ServerConfig) -> Result<()> {
    let server = LockServer::bind(config)
        .await
        .with_context(|| format!("Failed to start lock server on {}", config.address()))?;

    let mut lifecycle = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            match event {
                ServerLifecycle::Started { addr } => {
                    tracing::info!(%addr, "accepting lock clients");
                }
                ServerLifecycle::Exception { message } => {
                    tracing::error!(%message, "lock server exception");
                }
            }
        }
    });

    let signals = shutdown::signal_channel()?;
    server.run(shutdown::wait(signals)).await?;
    tracing::info!("lock server stopped");
    Ok(())
}
