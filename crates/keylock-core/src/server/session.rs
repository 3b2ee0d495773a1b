//! Server-side protocol state machine.
//!
//! Task lifecycle: `Queued -> Dispatched -> Completed`, or `Dispatched -> TimedOut` when
//! the wheel fires before `done` arrives. Completion and timeout both release the key's
//! queue slot, which admits the next waiter and sends it `toDo`.
//!
//! A timed-out task is not told to stop. If its `done` shows up later it finds nothing
//! to release and is ignored; the client's own, shorter deadline normally fires first.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};

use crate::{
    protocol::{Aquire, ClientMessage, Done, LockKey, ServerMessage, TaskAnnouncement, TaskId, ToDo},
    queue::{Enqueued, KeyQueue, Ticket},
    wheel::{Tick, Ticker, TimeoutWheel},
};

/// Server-assigned identity of one accepted socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Input to the session dispatch loop.
#[derive(Debug)]
pub enum SessionEvent {
    Connected {
        conn: ConnId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        conn: ConnId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnId,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TaskState {
    Queued,
    Dispatched,
}

#[derive(Debug)]
struct TaskEntry {
    key: LockKey,
    conn: ConnId,
    ticket: Ticket,
    timeout_secs: u64,
    state: TaskState,
}

/// Point-in-time counters for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub tasks: usize,
    pub dispatched: usize,
    pub active_keys: usize,
    pub connections: usize,
    pub tick: u64,
}

/// Owns every piece of server lock state. Mutated only from the dispatch loop.
#[derive(Debug, Default)]
pub struct ServerSession {
    queue: KeyQueue<TaskId>,
    wheel: TimeoutWheel<TaskId>,
    tasks: HashMap<TaskId, TaskEntry>,
    connections: HashMap<ConnId, mpsc::UnboundedSender<ServerMessage>>,
    stats_tx: Option<watch::Sender<SessionStats>>,
}

impl ServerSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a [`SessionStats`] snapshot after every event and tick handled by `run`.
    #[must_use]
    pub fn with_stats(mut self, stats_tx: watch::Sender<SessionStats>) -> Self {
        self.stats_tx = Some(stats_tx);
        self
    }

    /// Dispatch loop: apply events and ticks until the event source closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>, mut ticker: Ticker) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.apply(event);
                }
                tick = ticker.tick() => {
                    if tick.is_none() {
                        tracing::warn!("tick source closed, stopping lock session");
                        break;
                    }
                    self.tick();
                }
            }
            if let Some(stats_tx) = &self.stats_tx {
                stats_tx.send_replace(self.stats());
            }
        }
        tracing::debug!(stats = ?self.stats(), "lock session stopped");
    }

    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { conn, outbound } => self.connect(conn, outbound),
            SessionEvent::Message { conn, message } => self.handle(conn, message),
            SessionEvent::Disconnected { conn } => self.disconnect(conn),
        }
    }

    pub fn connect(&mut self, conn: ConnId, outbound: mpsc::UnboundedSender<ServerMessage>) {
        tracing::debug!(%conn, "connection registered");
        self.connections.insert(conn, outbound);
    }

    /// Forget the socket. Tasks stay bound to `conn` until `updateTaskSocket` or timeout.
    pub fn disconnect(&mut self, conn: ConnId) {
        self.connections.remove(&conn);
        let orphaned = self.tasks.values().filter(|t| t.conn == conn).count();
        tracing::info!(%conn, orphaned, "connection closed");
    }

    pub fn handle(&mut self, conn: ConnId, message: ClientMessage) {
        match message {
            ClientMessage::Aquire(aquire) => self.aquire(conn, aquire),
            ClientMessage::Done(done) => self.done(&done),
            ClientMessage::UpdateTaskSocket(tasks) => self.update_task_socket(conn, tasks),
        }
    }

    /// Advance the wheel one tick and reclaim every dispatched task whose deadline passed.
    pub fn tick(&mut self) -> Tick {
        let mut fired = Vec::new();
        let now = self.wheel.advance(|task_id| fired.push(task_id));
        for task_id in fired {
            let dispatched = self
                .tasks
                .get(&task_id)
                .is_some_and(|t| t.state == TaskState::Dispatched);
            if dispatched {
                tracing::info!(task = %task_id, tick = %now, "task timeout to clean");
                self.complete(&task_id);
            }
        }
        now
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            tasks: self.tasks.len(),
            dispatched: self
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Dispatched)
                .count(),
            active_keys: self.queue.active_keys(),
            connections: self.connections.len(),
            tick: self.wheel.now().get(),
        }
    }

    fn aquire(&mut self, conn: ConnId, aquire: Aquire) {
        let Aquire {
            lock_key,
            task_id,
            timeout,
        } = aquire;

        if let Some(entry) = self.tasks.get_mut(&task_id) {
            tracing::warn!(task = %task_id, key = %lock_key, "duplicate aquire, rebinding only");
            entry.conn = conn;
            return;
        }

        let enqueued = self.queue.enqueue(&lock_key, task_id.clone());
        tracing::info!(task = %task_id, key = %lock_key, %conn, "aquire");
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                key: lock_key,
                conn,
                ticket: enqueued.ticket(),
                timeout_secs: timeout,
                state: TaskState::Queued,
            },
        );
        match enqueued {
            Enqueued::Admitted(_) => self.dispatch(&task_id),
            Enqueued::Waiting { position, .. } => {
                tracing::debug!(task = %task_id, position, "queued");
            }
        }
    }

    fn done(&mut self, done: &Done) {
        match self.tasks.get(&done.task_id).map(|t| (t.state, &t.key)) {
            Some((TaskState::Dispatched, key)) => {
                if key != &done.lock_key {
                    tracing::warn!(task = %done.task_id, sent = %done.lock_key, held = %key, "done names a different key");
                }
                tracing::info!(task = %done.task_id, key = %done.lock_key, "done");
                self.complete(&done.task_id);
            }
            Some((TaskState::Queued, _)) => {
                tracing::debug!(task = %done.task_id, "done before dispatch ignored");
            }
            None => {
                tracing::debug!(task = %done.task_id, "duplicate or late done ignored");
            }
        }
    }

    fn update_task_socket(&mut self, conn: ConnId, announcements: Vec<TaskAnnouncement>) {
        for TaskAnnouncement { task_id, is_doing } in announcements {
            let Some(entry) = self.tasks.get_mut(&task_id) else {
                tracing::debug!(task = %task_id, "update for unknown task ignored");
                continue;
            };
            entry.conn = conn;
            tracing::info!(task = %task_id, %conn, is_doing, "task update socket");
            if entry.state == TaskState::Dispatched && !is_doing {
                self.send_to_do(&task_id);
            }
        }
    }

    /// Admitted: start the server-side deadline and tell the client to run.
    fn dispatch(&mut self, task_id: &TaskId) {
        let Some(entry) = self.tasks.get_mut(task_id) else {
            return;
        };
        entry.state = TaskState::Dispatched;
        let deadline = self.wheel.deadline_after(entry.timeout_secs);
        self.wheel.schedule(deadline, task_id.clone());
        self.send_to_do(task_id);
    }

    /// Drop a dispatched task and hand its key to the next waiter.
    fn complete(&mut self, task_id: &TaskId) {
        let Some(entry) = self.tasks.remove(task_id) else {
            return;
        };
        if let Some(next) = self.queue.release(&entry.key, entry.ticket) {
            self.dispatch(&next.item);
        }
    }

    fn send_to_do(&self, task_id: &TaskId) {
        let Some(entry) = self.tasks.get(task_id) else {
            return;
        };
        let message = ServerMessage::ToDo(ToDo {
            task_id: task_id.clone(),
        });
        let delivered = self
            .connections
            .get(&entry.conn)
            .is_some_and(|outbound| outbound.send(message).is_ok());
        if delivered {
            tracing::info!(task = %task_id, conn = %entry.conn, "let task to do");
        } else {
            tracing::warn!(task = %task_id, conn = %entry.conn, "toDo undeliverable, waiting for client to reconnect");
        }
    }
}
