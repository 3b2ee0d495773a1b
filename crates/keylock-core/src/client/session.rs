//! Client-side session driver.
//!
//! Owns every in-flight `lock()` attempt of one [`LockClient`](super::LockClient) and is
//! the only place that writes to the server. `lock()` callers talk to it through
//! [`DriverCommand`]s and hear back through a per-task [`TaskSignal`] channel.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::ClientEvent;
use crate::{
    protocol::{
        Aquire, ClientMessage, Done, LockKey, ServerMessage, TaskAnnouncement, TaskId, ToDo,
        SERVER_GRACE_SECS,
    },
    wheel::{Tick, Ticker, TimeoutWheel},
    Result,
};

#[derive(Debug)]
pub(crate) enum DriverCommand {
    Register {
        task_id: TaskId,
        key: LockKey,
        timeout_secs: u64,
        signals: mpsc::UnboundedSender<TaskSignal>,
    },
    /// The `lock()` call ended, for whatever reason.
    Finish { task_id: TaskId },
    Connected {
        outbound: mpsc::UnboundedSender<ClientMessage>,
    },
    Disconnected { reason: Option<String> },
    Inbound(Result<ServerMessage>),
    /// Close the connection after pending writes; `ack` fires once the server hung up.
    Close { ack: oneshot::Sender<()> },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TaskSignal {
    ToDo,
    Expired,
}

#[derive(Debug)]
struct InFlight {
    key: LockKey,
    deadline: Tick,
    /// Server admitted us and the user task is running
    doing: bool,
    /// `aquire` reached a live connection
    aquired: bool,
    /// `None` once the caller went away before admission
    signals: Option<mpsc::UnboundedSender<TaskSignal>>,
}

#[derive(Debug)]
pub(crate) struct ClientSession {
    wheel: TimeoutWheel<TaskId>,
    in_flight: HashMap<TaskId, InFlight>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    unsent_done: Vec<Done>,
    events: broadcast::Sender<ClientEvent>,
    connected: watch::Sender<bool>,
    closing: Option<oneshot::Sender<()>>,
}

impl ClientSession {
    pub(crate) fn new(events: broadcast::Sender<ClientEvent>, connected: watch::Sender<bool>) -> Self {
        Self {
            wheel: TimeoutWheel::new(),
            in_flight: HashMap::new(),
            outbound: None,
            unsent_done: Vec::new(),
            events,
            connected,
            closing: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        mut ticker: Ticker,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.apply(command);
                }
                tick = ticker.tick() => {
                    if tick.is_none() {
                        tracing::warn!("tick source closed, stopping lock client");
                        break;
                    }
                    self.tick();
                }
            }
        }
    }

    pub(crate) fn apply(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Register {
                task_id,
                key,
                timeout_secs,
                signals,
            } => self.register(task_id, key, timeout_secs, signals),
            DriverCommand::Finish { task_id } => self.finish(&task_id),
            DriverCommand::Connected { outbound } => self.connected(outbound),
            DriverCommand::Disconnected { reason } => self.disconnected(reason),
            DriverCommand::Inbound(Ok(ServerMessage::ToDo(ToDo { task_id }))) => self.to_do(&task_id),
            DriverCommand::Inbound(Err(e)) => {
                tracing::error!(error = %e, "unsupported message from lock server");
                let _ = self.events.send(ClientEvent::Exception(e.to_string()));
            }
            DriverCommand::Close { ack } => self.close(ack),
        }
    }

    /// One tick: every attempt past its deadline is told it expired and forgotten.
    ///
    /// No `done` goes out for an expired attempt. The server frees the key on its own
    /// deadline, which is `SERVER_GRACE_SECS` later.
    pub(crate) fn tick(&mut self) {
        let mut fired = Vec::new();
        self.wheel.advance(|task_id| fired.push(task_id));
        for task_id in fired {
            let Some(entry) = self.in_flight.remove(&task_id) else {
                continue;
            };
            tracing::warn!(task = %task_id, key = %entry.key, doing = entry.doing, "lock timeout");
            if let Some(signals) = entry.signals {
                let _ = signals.send(TaskSignal::Expired);
            }
        }
    }

    fn register(
        &mut self,
        task_id: TaskId,
        key: LockKey,
        timeout_secs: u64,
        signals: mpsc::UnboundedSender<TaskSignal>,
    ) {
        let deadline = self
            .wheel
            .schedule(self.wheel.deadline_after(timeout_secs), task_id.clone());

        let aquired = self.send(ClientMessage::Aquire(Aquire {
            lock_key: key.clone(),
            task_id: task_id.clone(),
            timeout: timeout_secs.saturating_add(SERVER_GRACE_SECS),
        }));
        if aquired {
            tracing::info!(task = %task_id, key = %key, timeout_secs, "aquire");
        } else {
            tracing::info!(task = %task_id, key = %key, "not connected, aquire deferred");
        }
        self.in_flight.insert(
            task_id,
            InFlight {
                key,
                deadline,
                doing: false,
                aquired,
                signals: Some(signals),
            },
        );
    }

    fn to_do(&mut self, task_id: &TaskId) {
        let Some(entry) = self.in_flight.get_mut(task_id) else {
            tracing::debug!(task = %task_id, "toDo for task no longer tracked");
            return;
        };
        if entry.doing {
            tracing::debug!(task = %task_id, "duplicate toDo ignored");
            return;
        }
        entry.doing = true;
        let delivered = entry
            .signals
            .as_ref()
            .is_some_and(|signals| signals.send(TaskSignal::ToDo).is_ok());
        if delivered {
            tracing::debug!(task = %task_id, "admitted");
        } else {
            // caller is gone; hand the key straight back
            self.finish(task_id);
        }
    }

    fn finish(&mut self, task_id: &TaskId) {
        let Some(entry) = self.in_flight.get_mut(task_id) else {
            return;
        };
        if !entry.doing && entry.aquired {
            // still queued server-side: answer its toDo with done when it comes
            entry.signals = None;
            tracing::debug!(task = %task_id, "abandoned before admission");
            return;
        }
        let Some(entry) = self.in_flight.remove(task_id) else {
            return;
        };
        if !entry.doing {
            return;
        }
        let done = Done {
            task_id: task_id.clone(),
            lock_key: entry.key,
        };
        tracing::info!(task = %done.task_id, key = %done.lock_key, "done");
        if !self.send(ClientMessage::Done(done.clone())) {
            self.unsent_done.push(done);
        }
    }

    fn connected(&mut self, outbound: mpsc::UnboundedSender<ClientMessage>) {
        self.outbound = Some(outbound);
        self.connected.send_replace(true);
        let _ = self.events.send(ClientEvent::Connected);

        let announcements: Vec<TaskAnnouncement> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.aquired)
            .map(|(task_id, entry)| TaskAnnouncement {
                task_id: task_id.clone(),
                is_doing: entry.doing,
            })
            .collect();
        tracing::info!(tasks = announcements.len(), "connected, updating task socket");
        self.send(ClientMessage::UpdateTaskSocket(announcements));

        for done in std::mem::take(&mut self.unsent_done) {
            if !self.send(ClientMessage::Done(done.clone())) {
                self.unsent_done.push(done);
            }
        }

        if self.closing.is_some() {
            self.outbound = None;
            return;
        }

        let deferred: Vec<(TaskId, LockKey, Tick)> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| !entry.aquired)
            .map(|(task_id, entry)| (task_id.clone(), entry.key.clone(), entry.deadline))
            .collect();
        for (task_id, key, deadline) in deferred {
            let remaining = deadline.get().saturating_sub(self.wheel.now().get());
            let sent = self.send(ClientMessage::Aquire(Aquire {
                lock_key: key,
                task_id: task_id.clone(),
                timeout: remaining.saturating_add(SERVER_GRACE_SECS),
            }));
            if let Some(entry) = self.in_flight.get_mut(&task_id) {
                entry.aquired = sent;
            }
        }
    }

    /// Dropping the outbound sender lets the writer drain and shut down its half.
    ///
    /// While disconnected with `done` messages still unsent, the ack waits for the next
    /// connection to flush them and hang up.
    fn close(&mut self, ack: oneshot::Sender<()>) {
        if self.outbound.take().is_some() {
            tracing::debug!(in_flight = self.in_flight.len(), "closing lock server connection");
            self.closing = Some(ack);
        } else if self.unsent_done.is_empty() {
            let _ = ack.send(());
        } else {
            tracing::debug!(unsent = self.unsent_done.len(), "close waits for reconnect to flush done");
            self.closing = Some(ack);
        }
    }

    fn disconnected(&mut self, reason: Option<String>) {
        self.outbound = None;
        self.connected.send_replace(false);
        if self.unsent_done.is_empty() {
            if let Some(ack) = self.closing.take() {
                let _ = ack.send(());
            }
        }
        match reason {
            Some(reason) => {
                tracing::warn!(%reason, in_flight = self.in_flight.len(), "lost lock server connection");
                let _ = self.events.send(ClientEvent::Exception(reason));
            }
            None => {
                tracing::info!(in_flight = self.in_flight.len(), "lock server closed connection");
            }
        }
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    /// Fire-and-forget write; `false` when there is no live connection.
    fn send(&mut self, message: ClientMessage) -> bool {
        let sent = self
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(message).is_ok());
        if !sent {
            self.outbound = None;
        }
        sent
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        session: ClientSession,
        events: broadcast::Receiver<ClientEvent>,
        wire: mpsc::UnboundedReceiver<ClientMessage>,
    }

    impl Harness {
        fn connected() -> Self {
            let (events_tx, events) = broadcast::channel(16);
            let (connected_tx, _) = watch::channel(false);
            let mut session = ClientSession::new(events_tx, connected_tx);
            let (outbound, wire) = mpsc::unbounded_channel();
            session.apply(DriverCommand::Connected { outbound });
            let mut harness = Self {
                session,
                events,
                wire,
            };
            harness.sent();
            harness
        }

        fn register(&mut self, task: &str, timeout_secs: u64) -> mpsc::UnboundedReceiver<TaskSignal> {
            let (signals, rx) = mpsc::unbounded_channel();
            self.session.apply(DriverCommand::Register {
                task_id: TaskId::new(task),
                key: LockKey::new("k"),
                timeout_secs,
                signals,
            });
            rx
        }

        fn to_do(&mut self, task: &str) {
            self.session
                .apply(DriverCommand::Inbound(Ok(ServerMessage::ToDo(ToDo {
                    task_id: TaskId::new(task),
                }))));
        }

        fn finish(&mut self, task: &str) {
            self.session.apply(DriverCommand::Finish {
                task_id: TaskId::new(task),
            });
        }

        fn reconnect(&mut self) {
            self.session
                .apply(DriverCommand::Disconnected { reason: None });
            let (outbound, wire) = mpsc::unbounded_channel();
            self.wire = wire;
            self.session.apply(DriverCommand::Connected { outbound });
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut sent = Vec::new();
            while let Ok(message) = self.wire.try_recv() {
                sent.push(message);
            }
            sent
        }
    }

    fn done(task: &str) -> ClientMessage {
        ClientMessage::Done(Done {
            task_id: TaskId::new(task),
            lock_key: LockKey::new("k"),
        })
    }

    #[test]
    fn test_register_sends_aquire_with_grace() {
        let mut harness = Harness::connected();
        let _signals = harness.register("t1", 3);
        assert_eq!(
            harness.sent(),
            vec![ClientMessage::Aquire(Aquire {
                lock_key: LockKey::new("k"),
                task_id: TaskId::new("t1"),
                timeout: 3 + SERVER_GRACE_SECS,
            })]
        );
    }

    #[test]
    fn test_to_do_admits_and_finish_sends_done() {
        let mut harness = Harness::connected();
        let mut signals = harness.register("t1", 30);
        harness.sent();

        harness.to_do("t1");
        assert_eq!(signals.try_recv().ok(), Some(TaskSignal::ToDo));

        harness.finish("t1");
        assert_eq!(harness.sent(), vec![done("t1")]);
        assert_eq!(harness.session.tracked(), 0);

        harness.finish("t1");
        assert!(harness.sent().is_empty(), "done only once");
    }

    #[test]
    fn test_expiry_signals_caller_without_done() {
        let mut harness = Harness::connected();
        let mut signals = harness.register("t1", 1);
        harness.sent();
        harness.to_do("t1");
        let _ = signals.try_recv();

        harness.session.tick();
        assert_eq!(signals.try_recv().ok(), Some(TaskSignal::Expired));
        harness.finish("t1");
        assert!(harness.sent().is_empty());
        assert_eq!(harness.session.tracked(), 0);
    }

    #[test]
    fn test_late_to_do_after_expiry_is_ignored() {
        let mut harness = Harness::connected();
        let mut signals = harness.register("t1", 1);
        harness.session.tick();
        assert_eq!(signals.try_recv().ok(), Some(TaskSignal::Expired));

        harness.to_do("t1");
        assert!(signals.try_recv().is_err());
    }

    #[test]
    fn test_abandoned_task_answers_its_to_do_with_done() {
        let mut harness = Harness::connected();
        let signals = harness.register("t1", 30);
        harness.sent();

        drop(signals);
        harness.finish("t1");
        assert!(harness.sent().is_empty());
        assert_eq!(harness.session.tracked(), 1);

        harness.to_do("t1");
        assert_eq!(harness.sent(), vec![done("t1")]);
        assert_eq!(harness.session.tracked(), 0);
    }

    #[test]
    fn test_reconnect_announces_in_flight_tasks() {
        let mut harness = Harness::connected();
        let _waiting = harness.register("waiting", 30);
        let _running = harness.register("running", 30);
        harness.to_do("running");
        harness.sent();

        harness.reconnect();
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        let ClientMessage::UpdateTaskSocket(mut announced) = sent[0].clone() else {
            panic!("expected updateTaskSocket, got {:?}", sent[0]);
        };
        announced.sort_by(|a, b| a.task_id.as_str().cmp(b.task_id.as_str()));
        assert_eq!(
            announced,
            vec![
                TaskAnnouncement {
                    task_id: TaskId::new("running"),
                    is_doing: true
                },
                TaskAnnouncement {
                    task_id: TaskId::new("waiting"),
                    is_doing: false
                },
            ]
        );
    }

    #[test]
    fn test_reconnect_with_nothing_in_flight_sends_empty_update() {
        let mut harness = Harness::connected();
        harness.reconnect();
        assert_eq!(
            harness.sent(),
            vec![ClientMessage::UpdateTaskSocket(Vec::new())]
        );
    }

    #[test]
    fn test_offline_aquire_and_done_flushed_on_connect() {
        let mut harness = Harness::connected();
        let _held = harness.register("held", 30);
        harness.to_do("held");
        harness.session.apply(DriverCommand::Disconnected {
            reason: Some("reset".into()),
        });

        harness.finish("held");
        let _fresh = harness.register("fresh", 10);
        harness.session.tick();

        let (outbound, wire) = mpsc::unbounded_channel();
        harness.wire = wire;
        harness.session.apply(DriverCommand::Connected { outbound });
        assert_eq!(
            harness.sent(),
            vec![
                ClientMessage::UpdateTaskSocket(Vec::new()),
                done("held"),
                ClientMessage::Aquire(Aquire {
                    lock_key: LockKey::new("k"),
                    task_id: TaskId::new("fresh"),
                    timeout: 9 + SERVER_GRACE_SECS,
                }),
            ]
        );
    }

    #[test]
    fn test_close_acks_once_server_hangs_up() {
        let mut harness = Harness::connected();
        let (ack, mut acked) = oneshot::channel();
        harness.session.apply(DriverCommand::Close { ack });
        assert!(harness.wire.try_recv().is_err());
        assert!(acked.try_recv().is_err(), "still waiting for the server");

        harness
            .session
            .apply(DriverCommand::Disconnected { reason: None });
        assert_eq!(acked.try_recv(), Ok(()));
    }

    #[test]
    fn test_close_while_disconnected_waits_to_flush_done() {
        let mut harness = Harness::connected();
        let _held = harness.register("held", 30);
        harness.to_do("held");
        harness.session.apply(DriverCommand::Disconnected {
            reason: Some("reset".into()),
        });
        harness.finish("held");

        let (ack, mut acked) = oneshot::channel();
        harness.session.apply(DriverCommand::Close { ack });
        assert!(acked.try_recv().is_err(), "done not sent yet");

        let (outbound, wire) = mpsc::unbounded_channel();
        harness.wire = wire;
        harness.session.apply(DriverCommand::Connected { outbound });
        assert_eq!(
            harness.sent(),
            vec![ClientMessage::UpdateTaskSocket(Vec::new()), done("held")]
        );
        assert!(
            matches!(harness.wire.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)),
            "connection is handed back once flushed"
        );
        assert!(acked.try_recv().is_err(), "still waiting for the server");

        harness
            .session
            .apply(DriverCommand::Disconnected { reason: None });
        assert_eq!(acked.try_recv(), Ok(()));
    }

    #[test]
    fn test_close_while_disconnected_with_nothing_unsent_acks_at_once() {
        let mut harness = Harness::connected();
        harness
            .session
            .apply(DriverCommand::Disconnected { reason: None });

        let (ack, mut acked) = oneshot::channel();
        harness.session.apply(DriverCommand::Close { ack });
        assert_eq!(acked.try_recv(), Ok(()));
    }

    #[test]
    fn test_unsupported_message_published_as_exception() {
        let mut harness = Harness::connected();
        let _ = harness.events.try_recv();
        harness.session.apply(DriverCommand::Inbound(Err(crate::Error::Protocol(
            "unsupported message".into(),
        ))));
        assert!(matches!(
            harness.events.try_recv(),
            Ok(ClientEvent::Exception(_))
        ));
    }
}
