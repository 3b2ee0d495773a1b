//! Lock client.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use keylock_core::{ClientConfig, LockClient};
//!
//! let client = LockClient::connect(&ClientConfig::new("127.0.0.1", 7420))?;
//! let total = client
//!     .lock("orders", 10, || async { anyhow::Ok(40 + 2) })
//!     .await?;
//! assert_eq!(total, 42);
//! # Ok(())
//! # }
//! ```
//!
//! Every `lock()` runs its task only after the server admits it for the key, and the
//! whole call (waiting plus running) is bounded by `timeout_secs`. A call that times out
//! does not send `done`; the server takes the key back `SERVER_GRACE_SECS` later.

mod connector;
mod session;

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};

use self::session::{ClientSession, DriverCommand, TaskSignal};
use crate::{
    config::ClientConfig,
    protocol::{LockKey, TaskId, DEFAULT_LOCK_TIMEOUT_SECS},
    wheel::Ticker,
    Error, Result,
};

/// Connection notifications published by a [`LockClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Transport failure or unsupported server message
    Exception(String),
}

/// Handle to a client session. Clones share the session; the last one dropped stops it.
#[derive(Debug, Clone)]
pub struct LockClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    commands: mpsc::UnboundedSender<DriverCommand>,
    events: broadcast::Sender<ClientEvent>,
    connected: watch::Receiver<bool>,
    close_timeout: Duration,
    driver: JoinHandle<()>,
    connector: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.connector.abort();
        self.driver.abort();
    }
}

impl LockClient {
    /// Start a client session that keeps (re)connecting to `config`'s server.
    ///
    /// Returns immediately; `lock()` calls made before the first connection are sent
    /// once it is up.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when `config` does not validate.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        Self::connect_with_ticker(config, Ticker::spawn(Duration::from_secs(1)))
    }

    /// Like [`connect`](Self::connect) with an explicit tick source for local deadlines.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when `config` does not validate.
    pub fn connect_with_ticker(config: &ClientConfig, ticker: Ticker) -> Result<Self> {
        config.validate()?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (connected_tx, connected) = watch::channel(false);

        let driver = tokio::spawn(
            ClientSession::new(events.clone(), connected_tx).run(commands_rx, ticker),
        );
        let connector = tokio::spawn(connector::run(
            config.clone(),
            commands.clone(),
            events.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                events,
                connected,
                close_timeout: config.socket_timeout(),
                driver,
                connector,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Wait until the session has a live connection.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session stopped.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.inner.connected.clone();
        connected
            .wait_for(|up| *up)
            .await
            .map(|_| ())
            .map_err(|_| Error::SessionClosed)
    }

    /// Flush pending `done` messages and close the connection.
    ///
    /// Waits up to the socket timeout for the server to hang up. Call this before the
    /// process exits so the last release is not lost.
    pub async fn close(self) {
        let (ack, acked) = oneshot::channel();
        if self.inner.commands.send(DriverCommand::Close { ack }).is_ok()
            && tokio::time::timeout(self.inner.close_timeout, acked)
                .await
                .is_err()
        {
            tracing::warn!("lock server did not acknowledge close");
        }
    }

    /// Run `task` while holding `key`, giving up after `timeout_secs`.
    ///
    /// The task's own error comes back unchanged. Lock failures (`LockTimeout`,
    /// `SessionClosed`) are converted into `E`.
    pub async fn lock<F, Fut, T, E>(
        &self,
        key: impl Into<LockKey>,
        timeout_secs: u64,
        task: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let key = key.into();
        let task_id = TaskId::generate();
        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        self.inner
            .commands
            .send(DriverCommand::Register {
                task_id: task_id.clone(),
                key: key.clone(),
                timeout_secs,
                signals: signals_tx,
            })
            .map_err(|_| Error::SessionClosed)?;
        let _finish = FinishGuard {
            commands: &self.inner.commands,
            task_id,
        };

        match signals.recv().await {
            Some(TaskSignal::ToDo) => {}
            Some(TaskSignal::Expired) => {
                return Err(Error::lock_timeout(key.as_str(), timeout_secs).into());
            }
            None => return Err(Error::SessionClosed.into()),
        }

        tokio::select! {
            outcome = task() => outcome,
            err = until_expired(&mut signals, &key, timeout_secs) => Err(err.into()),
        }
    }

    /// [`lock`](Self::lock) with the default 30 second timeout.
    pub async fn lock_default<F, Fut, T, E>(
        &self,
        key: impl Into<LockKey>,
        task: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.lock(key, DEFAULT_LOCK_TIMEOUT_SECS, task).await
    }
}

async fn until_expired(
    signals: &mut mpsc::UnboundedReceiver<TaskSignal>,
    key: &LockKey,
    timeout_secs: u64,
) -> Error {
    loop {
        match signals.recv().await {
            Some(TaskSignal::ToDo) => {}
            Some(TaskSignal::Expired) => return Error::lock_timeout(key.as_str(), timeout_secs),
            None => return Error::SessionClosed,
        }
    }
}

/// Reports the end of a `lock()` call to the driver on every exit path, cancellation
/// included.
struct FinishGuard<'a> {
    commands: &'a mpsc::UnboundedSender<DriverCommand>,
    task_id: TaskId,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        let _ = self.commands.send(DriverCommand::Finish {
            task_id: self.task_id.clone(),
        });
    }
}
