//! Grid router - single-writer owner of live slots and offline inboxes
//!
//! Every mutation (route, connect, disconnect) is a command processed by one
//! task, so a flush on connect can never interleave with a concurrent route
//! to the same endpoint. Each endpoint has one ordered delivery channel,
//! which gives per-target FIFO.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::Psi;
use crate::error::{CoordinationError, CoordinationResult};

/// Endpoint that answers grid queries
pub const SYSTEM_ENDPOINT: &str = "system";

/// Distinguished listener receiving unit reports
pub const NEXUS_ENDPOINT: &str = "nexus";

/// Shared reference to Grid
pub type SharedGrid = Arc<Grid>;

/// Message parked for an endpoint that is not connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub target: String,
    pub source: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: String,
    pub enqueued_order: u64,
}

impl InboxEntry {
    fn to_psi(&self) -> Psi {
        Psi::new(&self.target, &self.source, &self.msg_type, &self.content)
    }
}

/// Snapshot answered to `status` queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridStatus {
    pub active_endpoints: Vec<String>,
    /// endpoint -> queued message count
    pub queued: BTreeMap<String, usize>,
}

enum Command {
    Route(Psi),
    Connect {
        endpoint: String,
        conn_id: u64,
        sender: mpsc::UnboundedSender<Psi>,
        ready: oneshot::Sender<()>,
    },
    Disconnect {
        endpoint: String,
        conn_id: u64,
        /// Relayed to the closing connection but never consumed, oldest first
        undelivered: Vec<Psi>,
    },
    Inbox {
        endpoint: String,
        reply: oneshot::Sender<Vec<InboxEntry>>,
    },
    Status {
        reply: oneshot::Sender<GridStatus>,
    },
}

struct Slot {
    conn_id: u64,
    sender: mpsc::UnboundedSender<Psi>,
}

#[derive(Default)]
struct RouterState {
    slots: HashMap<String, Slot>,
    inbox: HashMap<String, VecDeque<InboxEntry>>,
    next_order: u64,
}

impl RouterState {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Route(psi) => self.route(psi),
            Command::Connect {
                endpoint,
                conn_id,
                sender,
                ready,
            } => {
                self.connect(endpoint, conn_id, sender);
                let _ = ready.send(());
            }
            Command::Disconnect {
                endpoint,
                conn_id,
                undelivered,
            } => self.disconnect(&endpoint, conn_id, undelivered),
            Command::Inbox { endpoint, reply } => {
                let entries = self
                    .inbox
                    .get(&endpoint)
                    .map(|queue| queue.iter().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(entries);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn route(&mut self, psi: Psi) {
        if psi.target == SYSTEM_ENDPOINT && psi.msg_type == "status" {
            self.answer_status(&psi);
            return;
        }

        let Some(slot) = self.slots.get(&psi.target) else {
            debug!(endpoint = %psi.target, source = %psi.source, "Endpoint offline, queuing");
            self.enqueue(psi);
            return;
        };

        if let Err(mpsc::error::SendError(psi)) = slot.sender.send(psi) {
            // Receiver gone without a disconnect yet
            warn!(endpoint = %psi.target, "Relay failed, re-queuing");
            self.slots.remove(&psi.target);
            self.enqueue(psi);
        }
    }

    fn answer_status(&mut self, query: &Psi) {
        let result = match query.content.as_str() {
            "" | "status" => serde_json::to_string(&self.status()),
            other => serde_json::to_string(&serde_json::json!({
                "error": format!("Unknown command: {other}")
            })),
        };
        let body = result.unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#));
        self.route(Psi::new(&query.source, SYSTEM_ENDPOINT, "result", body));
    }

    fn enqueue(&mut self, psi: Psi) {
        let entry = InboxEntry {
            enqueued_order: self.next_order,
            target: psi.target,
            source: psi.source,
            msg_type: psi.msg_type,
            content: psi.content,
        };
        self.next_order += 1;
        self.inbox.entry(entry.target.clone()).or_default().push_back(entry);
    }

    fn connect(&mut self, endpoint: String, conn_id: u64, sender: mpsc::UnboundedSender<Psi>) {
        if let Some(mut queued) = self.inbox.remove(&endpoint) {
            info!(endpoint = %endpoint, queued = queued.len(), "Flushing inbox");
            while let Some(entry) = queued.pop_front() {
                if sender.send(entry.to_psi()).is_err() {
                    // Connection died mid-flush; keep the rest parked
                    queued.push_front(entry);
                    self.inbox.insert(endpoint, queued);
                    return;
                }
            }
        }

        if self
            .slots
            .insert(endpoint.clone(), Slot { conn_id, sender })
            .is_some()
        {
            info!(endpoint = %endpoint, conn_id, "Connection superseded older slot");
        } else {
            info!(endpoint = %endpoint, conn_id, "Endpoint connected");
        }
    }

    fn disconnect(&mut self, endpoint: &str, conn_id: u64, undelivered: Vec<Psi>) {
        let superseded = self
            .slots
            .get(endpoint)
            .is_some_and(|slot| slot.conn_id != conn_id);
        if superseded {
            // A newer connection owns the slot; hand it the leftovers
            debug!(endpoint, conn_id, leftovers = undelivered.len(), "Stale disconnect");
            for psi in undelivered {
                self.route(psi);
            }
            return;
        }

        if self.slots.remove(endpoint).is_some() {
            info!(endpoint, conn_id, "Endpoint disconnected");
        }
        self.requeue_front(endpoint, undelivered);
    }

    /// Park messages ahead of anything already queued for `endpoint`
    fn requeue_front(&mut self, endpoint: &str, undelivered: Vec<Psi>) {
        if undelivered.is_empty() {
            return;
        }
        debug!(endpoint, requeued = undelivered.len(), "Re-queuing undelivered messages");
        let queued = self.inbox.remove(endpoint).unwrap_or_default();
        let ordered: Vec<Psi> = undelivered
            .into_iter()
            .chain(queued.into_iter().map(|entry| entry.to_psi()))
            .collect();
        for psi in ordered {
            self.enqueue(psi);
        }
    }

    fn status(&self) -> GridStatus {
        let mut active_endpoints: Vec<String> = self.slots.keys().cloned().collect();
        active_endpoints.sort();
        GridStatus {
            active_endpoints,
            queued: self
                .inbox
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(endpoint, q)| (endpoint.clone(), q.len()))
                .collect(),
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
    let mut state = RouterState::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => state.handle(command),
                None => break,
            },
        }
    }
    info!(
        connected = state.slots.len(),
        queued = state.inbox.values().map(VecDeque::len).sum::<usize>(),
        "Grid stopped"
    );
}

/// Point-to-point router with offline delivery
pub struct Grid {
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    next_conn: AtomicU64,
}

impl Grid {
    pub fn new() -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            commands,
            pending: Mutex::new(Some(pending)),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            next_conn: AtomicU64::new(1),
        }
    }

    /// Create a shared reference to this grid
    pub fn shared(self) -> SharedGrid {
        Arc::new(self)
    }

    /// Start the router task. Commands issued earlier are processed in order.
    pub fn start(&self) {
        let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let handle = tokio::spawn(run(pending, self.cancel.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Grid started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) -> CoordinationResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CoordinationError::ConnectionUnavailable("grid stopped".into()))
    }

    /// Relay to the target's live slot, or park in its inbox
    pub fn route(&self, psi: Psi) -> CoordinationResult<()> {
        self.send(Command::Route(psi))
    }

    pub fn route_message(
        &self,
        target: &str,
        source: &str,
        msg_type: &str,
        content: &str,
    ) -> CoordinationResult<()> {
        self.route(Psi::new(target, source, msg_type, content))
    }

    /// Register a live connection for `endpoint`. Queued messages are
    /// already in the returned connection's stream, in enqueue order.
    pub async fn connect(&self, endpoint: &str) -> CoordinationResult<Connection> {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (ready, ready_rx) = oneshot::channel();
        self.send(Command::Connect {
            endpoint: endpoint.to_string(),
            conn_id,
            sender,
            ready,
        })?;
        ready_rx
            .await
            .map_err(|_| CoordinationError::ConnectionUnavailable(endpoint.to_string()))?;

        Ok(Connection {
            endpoint: endpoint.to_string(),
            conn_id,
            receiver,
            commands: self.commands.clone(),
            closed: false,
        })
    }

    /// Messages queued for `endpoint`, oldest first
    pub async fn inbox(&self, endpoint: &str) -> CoordinationResult<Vec<InboxEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inbox {
            endpoint: endpoint.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| CoordinationError::ConnectionUnavailable("grid stopped".into()))
    }

    pub async fn status(&self) -> CoordinationResult<GridStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await
            .map_err(|_| CoordinationError::ConnectionUnavailable("grid stopped".into()))
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Grid {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Live slot held by one connected endpoint; disconnects on drop
pub struct Connection {
    endpoint: String,
    conn_id: u64,
    receiver: mpsc::UnboundedReceiver<Psi>,
    commands: mpsc::UnboundedSender<Command>,
    closed: bool,
}

impl Connection {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next message for this endpoint; `None` once superseded or the grid
    /// stopped
    pub async fn recv(&mut self) -> Option<Psi> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Psi> {
        self.receiver.try_recv().ok()
    }

    /// Release the slot. Messages relayed here but never consumed go back
    /// to the front of the endpoint's inbox in the same router step, so
    /// later routes cannot overtake them. Returns how many were re-queued.
    pub fn close(self) -> usize {
        self.close_with(None)
    }

    /// Like [`Connection::close`], with messages the caller already took off
    /// the stream but failed to deliver placed first
    pub fn close_with<I>(mut self, unsent: I) -> usize
    where
        I: IntoIterator<Item = Psi>,
    {
        self.release(unsent.into_iter().collect())
    }

    fn release(&mut self, mut undelivered: Vec<Psi>) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        self.receiver.close();
        while let Ok(psi) = self.receiver.try_recv() {
            undelivered.push(psi);
        }
        let requeued = undelivered.len();
        let _ = self.commands.send(Command::Disconnect {
            endpoint: self.endpoint.clone(),
            conn_id: self.conn_id,
            undelivered,
        });
        requeued
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        let grid = Grid::new();
        grid.start();
        grid
    }

    #[tokio::test]
    async fn test_live_relay_preserves_order() {
        let grid = grid();
        let mut zealot = grid.connect("zealot-1").await.unwrap();

        for i in 0..5 {
            grid.route_message("zealot-1", "arbiter-1", "task", &format!("step {i}"))
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(zealot.recv().await.unwrap().content, format!("step {i}"));
        }
        assert!(grid.inbox("zealot-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_falls_back_to_inbox() {
        let grid = grid();
        let conn = grid.connect("archon-1").await.unwrap();
        drop(conn);

        grid.route_message("archon-1", "zealot-1", "review", "please").unwrap();
        let inbox = grid.inbox("archon-1").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].source, "zealot-1");
        assert_eq!(inbox[0].msg_type, "review");
    }

    #[tokio::test]
    async fn test_superseding_connection_takes_over() {
        let grid = grid();
        let mut first = grid.connect("oracle-1").await.unwrap();
        let mut second = grid.connect("oracle-1").await.unwrap();

        // The first slot's sender was replaced, so its stream ends
        assert!(first.recv().await.is_none());
        drop(first);

        grid.route_message("oracle-1", "human", "ask", "hi").unwrap();
        assert_eq!(second.recv().await.unwrap().content, "hi");

        let status = grid.status().await.unwrap();
        assert_eq!(status.active_endpoints, vec!["oracle-1".to_string()]);
    }

    #[tokio::test]
    async fn test_system_status_query() {
        let grid = grid();
        grid.route_message("zealot-9", "arbiter-1", "task", "queued").unwrap();
        let mut cli = grid.connect("cli").await.unwrap();

        grid.route_message(SYSTEM_ENDPOINT, "cli", "status", "status").unwrap();
        let reply = cli.recv().await.unwrap();
        assert_eq!(reply.source, SYSTEM_ENDPOINT);
        assert_eq!(reply.msg_type, "result");

        let status: GridStatus = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(status.active_endpoints, vec!["cli".to_string()]);
        assert_eq!(status.queued.get("zealot-9"), Some(&1));
    }

    #[tokio::test]
    async fn test_close_requeues_unconsumed_messages() {
        let grid = grid();
        let conn = grid.connect("zealot-2").await.unwrap();
        grid.route_message("zealot-2", "a", "t", "one").unwrap();
        grid.route_message("zealot-2", "a", "t", "two").unwrap();
        // Round trip through the router so both relays happened
        grid.status().await.unwrap();

        assert_eq!(conn.close(), 2);
        let inbox = grid.inbox("zealot-2").await.unwrap();
        assert_eq!(
            inbox.iter().map(|e| e.content.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
    }

    #[tokio::test]
    async fn test_superseded_close_hands_leftovers_to_successor() {
        let grid = grid();
        let first = grid.connect("oracle-2").await.unwrap();
        grid.route_message("oracle-2", "a", "t", "early").unwrap();
        let mut second = grid.connect("oracle-2").await.unwrap();

        assert_eq!(first.close(), 1);
        assert_eq!(second.recv().await.unwrap().content, "early");
        assert!(grid.inbox("oracle-2").await.unwrap().is_empty());
    }
}
