//! Length-framed message transport.
//!
//! Frame layout: 4-byte big-endian payload length, then the JSON payload. A zero-length
//! frame is a heartbeat; it keeps an idle connection open and is never delivered.
//!
//! Each connection is split into a reader loop (run by the owner) and a spawned writer
//! task fed by an unbounded channel. Dropping every sender closes the writer, which shuts
//! down the write half so the peer sees EOF.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};

use crate::{protocol, Error, Result};

/// Largest payload accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Upper bound on the heartbeat period, whatever the local idle timeout.
///
/// Keeps a peer with an idle timeout above this alive even when its timeout is much
/// shorter than ours.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Read one frame. `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(Error::Transport(format!("read frame len: {e}")));
    }
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > MAX_FRAME_BYTES {
        return Err(Error::Transport(format!(
            "frame too large: {payload_len} bytes"
        )));
    }
    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("read frame payload: {e}")))?;
    Ok(Some(payload))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(Error::Transport(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Transport("frame length overflow".to_string()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Transport(format!("write frame: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("flush frame: {e}")))
}

/// Read and decode messages until EOF, handing each to `deliver`.
///
/// Decode failures are passed to `deliver` as `Err(Error::Protocol)` and the loop keeps
/// going. `deliver` returns `false` to stop reading. A connection silent for longer than
/// `idle` fails with a transport error.
pub async fn read_messages<R, In, F>(mut reader: R, idle: Duration, mut deliver: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    In: DeserializeOwned,
    F: FnMut(Result<In>) -> bool,
{
    loop {
        let frame = timeout(idle, read_frame(&mut reader))
            .await
            .map_err(|_| Error::Transport(format!("socket idle for {}s", idle.as_secs())))??;
        let Some(payload) = frame else {
            return Ok(());
        };
        if payload.is_empty() {
            continue;
        }
        if !deliver(protocol::decode(&payload)) {
            return Ok(());
        }
    }
}

/// Spawn the writer half of a connection.
///
/// Sends a heartbeat whenever nothing was written for a third of `idle` (at most
/// [`MAX_HEARTBEAT_INTERVAL`]), so the peer's idle timeout only trips on a dead
/// connection.
pub fn spawn_writer<W, Out>(
    mut writer: W,
    idle: Duration,
) -> (mpsc::UnboundedSender<Out>, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Out>();
    let period = heartbeat_interval(idle);
    let task = tokio::spawn(async move {
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(message) = outbound else {
                        break;
                    };
                    write_frame(&mut writer, &protocol::encode(&message)?).await?;
                    heartbeat.reset();
                }
                _ = heartbeat.tick() => {
                    write_frame(&mut writer, &[]).await?;
                }
            }
        }
        writer
            .shutdown()
            .await
            .map_err(|e| Error::Transport(format!("shutdown: {e}")))
    });
    (tx, task)
}

fn heartbeat_interval(idle: Duration) -> Duration {
    (idle / 3).clamp(MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL)
}
