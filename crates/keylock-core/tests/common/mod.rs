//! Shared fixtures for end-to-end lock tests: a loopback server with hand-driven ticks,
//! clients wired to it, and a TCP proxy that can cut a client off mid-session.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use keylock_core::{
    ClientConfig, LockClient, LockServer, ServerConfig, ServerHandle, TickHandle, Ticker,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::Instant,
};

/// Server on an ephemeral loopback port whose wheel only moves when the test says so.
pub async fn start_server() -> (ServerHandle, TickHandle) {
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let (ticks, ticker) = Ticker::manual();
    let server = LockServer::bind(&config)
        .await
        .expect("bind loopback")
        .with_ticker(ticker);
    (server.spawn().expect("spawn server"), ticks)
}

pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        reconnect_delay_ms: 50,
        ..ClientConfig::new(addr.ip().to_string(), addr.port())
    }
}

/// Client with hand-driven local deadlines, already connected.
pub async fn connect_client(addr: SocketAddr) -> (LockClient, TickHandle) {
    let (ticks, ticker) = Ticker::manual();
    let client =
        LockClient::connect_with_ticker(&client_config(addr), ticker).expect("client config");
    within(client.wait_connected()).await.expect("connected");
    (client, ticks)
}

/// Await `future`, failing the test after five seconds.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Forwarding proxy between one or more clients and the lock server.
pub struct Proxy {
    addr: SocketAddr,
    paused: Arc<AtomicBool>,
    pipes: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Proxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let paused = Arc::new(AtomicBool::new(false));
        let pipes = Arc::new(Mutex::new(Vec::new()));

        let accept = tokio::spawn({
            let paused = Arc::clone(&paused);
            let pipes = Arc::clone(&pipes);
            async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    if paused.load(Ordering::SeqCst) {
                        drop(inbound);
                        continue;
                    }
                    let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                        continue;
                    };
                    let pipe = tokio::spawn(async move {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    });
                    pipes.lock().unwrap().push(pipe);
                }
            }
        });

        Self {
            addr,
            paused,
            pipes,
            accept,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Refuse new connections (accepted then closed immediately).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Drop every proxied connection; both sides see the socket close.
    pub fn sever(&self) {
        for pipe in self.pipes.lock().unwrap().drain(..) {
            pipe.abort();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.sever();
        self.accept.abort();
    }
}
