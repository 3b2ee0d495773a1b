//! Connection keeper for a lock client.
//!
//! Dials the server, pumps frames into the driver and, when the connection ends,
//! waits `reconnect_delay` and dials again. It stops once the driver is gone.

use tokio::{net::TcpStream, sync::broadcast, sync::mpsc};

use super::{session::DriverCommand, ClientEvent};
use crate::{
    config::ClientConfig,
    protocol::{ClientMessage, ServerMessage},
    transport,
};

pub(crate) async fn run(
    config: ClientConfig,
    commands: mpsc::UnboundedSender<DriverCommand>,
    events: broadcast::Sender<ClientEvent>,
) {
    let address = config.address();
    let idle = config.socket_timeout();
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "set_nodelay failed");
                }
                let (reader, writer) = stream.into_split();
                let (outbound, writer_task) =
                    transport::spawn_writer::<_, ClientMessage>(writer, idle);
                tracing::info!(%address, "connected to lock server");
                if commands.send(DriverCommand::Connected { outbound }).is_err() {
                    writer_task.abort();
                    return;
                }

                let read = transport::read_messages::<_, ServerMessage, _>(reader, idle, |message| {
                    commands.send(DriverCommand::Inbound(message)).is_ok()
                })
                .await;
                let reason = read.err().map(|e| e.to_string());
                if commands.send(DriverCommand::Disconnected { reason }).is_err() {
                    writer_task.abort();
                    return;
                }
                if let Ok(Err(e)) = writer_task.await {
                    tracing::debug!(error = %e, "writer stopped");
                }
            }
            Err(e) => {
                tracing::warn!(%address, error = %e, "connect failed");
                let _ = events.send(ClientEvent::Exception(format!("connect {address}: {e}")));
            }
        }
        if commands.is_closed() {
            return;
        }
        tokio::time::sleep(config.reconnect_delay()).await;
    }
}
