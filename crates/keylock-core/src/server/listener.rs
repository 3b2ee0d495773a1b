//! TCP front end for [`ServerSession`].
//!
//! One accept loop assigns a [`ConnId`] per socket and spawns a connection task that
//! reads frames into the session's event channel. Outbound frames go through a writer
//! task per connection whose sender is registered with the session.

use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
};

use super::session::{ConnId, ServerSession, SessionEvent, SessionStats};
use crate::{
    config::ServerConfig,
    protocol::{ClientMessage, ServerMessage},
    transport,
    wheel::Ticker,
    Error, Result,
};

/// Lifecycle notifications for the embedding process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLifecycle {
    Started { addr: SocketAddr },
    Exception { message: String },
}

/// A bound, not yet running lock server.
#[derive(Debug)]
pub struct LockServer {
    listener: TcpListener,
    socket_timeout: Duration,
    ticker: Option<Ticker>,
    lifecycle: broadcast::Sender<ServerLifecycle>,
    stats_tx: watch::Sender<SessionStats>,
}

impl LockServer {
    /// Validate `config` and bind its address.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for bad values and `Io` when the address cannot be bound.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let address = config.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| Error::Io(format!("bind {address}: {e}")))?;
        let (lifecycle, _) = broadcast::channel(16);
        let (stats_tx, _) = watch::channel(SessionStats::default());
        Ok(Self {
            listener,
            socket_timeout: config.socket_timeout(),
            ticker: None,
            lifecycle,
            stats_tx,
        })
    }

    /// Replace the one-second wall-clock ticker.
    #[must_use]
    pub fn with_ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns `Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerLifecycle> {
        self.lifecycle.subscribe()
    }

    /// Latest session counters, refreshed after every event the session handles.
    pub fn stats(&self) -> watch::Receiver<SessionStats> {
        self.stats_tx.subscribe()
    }

    /// Serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the bound address cannot be read back.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        let Self {
            listener,
            socket_timeout,
            ticker,
            lifecycle,
            stats_tx,
        } = self;

        let ticker = ticker.unwrap_or_else(|| Ticker::spawn(Duration::from_secs(1)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = tokio::spawn(ServerSession::new().with_stats(stats_tx).run(events_rx, ticker));

        let mut connections = JoinSet::new();
        let mut next_conn = 0_u64;

        tracing::info!(%addr, "lock server started");
        let _ = lifecycle.send(ServerLifecycle::Started { addr });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_conn += 1;
                        let conn = ConnId::new(next_conn);
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            conn,
                            events_tx.clone(),
                            socket_timeout,
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        let _ = lifecycle.send(ServerLifecycle::Exception {
                            message: format!("accept failed: {e}"),
                        });
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        tracing::info!(open = connections.len(), "lock server shutting down");
        connections.shutdown().await;
        drop(events_tx);
        if let Err(e) = session.await {
            tracing::error!(error = %e, "lock session task failed");
        }
        Ok(())
    }

    /// Run on a background task, returning a handle that stops it.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the bound address cannot be read back.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let stats = self.stats();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run(async move {
            let _ = stop_rx.await;
        }));
        Ok(ServerHandle {
            addr,
            stats,
            stop_tx: Some(stop_tx),
            task,
        })
    }
}

/// Handle to a server started with [`LockServer::spawn`].
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    stats: watch::Receiver<SessionStats>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        *self.stats.borrow()
    }

    /// Stop accepting, close every connection and wait for the server task.
    ///
    /// # Errors
    ///
    /// Returns the server's own error, or `Io` if its task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| Error::Io(format!("server task: {e}")))?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.task.abort();
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnId,
    events: mpsc::UnboundedSender<SessionEvent>,
    idle: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%conn, error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let (outbound, writer_task) = transport::spawn_writer::<_, ServerMessage>(writer, idle);

    tracing::info!(%conn, %peer, "client connected");
    if events
        .send(SessionEvent::Connected { conn, outbound })
        .is_err()
    {
        writer_task.abort();
        return;
    }

    let read = transport::read_messages::<_, ClientMessage, _>(reader, idle, |message| {
        match message {
            Ok(message) => {
                tracing::debug!(%conn, command = message.command(), "received");
                events.send(SessionEvent::Message { conn, message }).is_ok()
            }
            Err(e) => {
                tracing::error!(%conn, error = %e, "dropping message");
                true
            }
        }
    })
    .await;
    if let Err(e) = read {
        tracing::warn!(%conn, error = %e, "connection failed");
    }

    let _ = events.send(SessionEvent::Disconnected { conn });
    match writer_task.await {
        Ok(Err(e)) => tracing::debug!(%conn, error = %e, "writer stopped"),
        Err(e) => tracing::warn!(%conn, error = %e, "writer task failed"),
        Ok(Ok(())) => {}
    }
}
