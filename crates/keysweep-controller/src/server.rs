//! The controller session manager.
//!
//! One tokio task per connection; every shared mutation (cursor, pool,
//! session map, found state) goes through a single `Mutex<ControllerState>`,
//! so at most one allocation decision and one found-state transition is ever
//! in flight. Per-session reads carry the liveness timeout, and a periodic
//! scan sweeps sessions whose handler is wedged elsewhere.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use keysweep_core::fingerprint::TargetFingerprint;
use keysweep_core::types::{MatchRecord, NodeId};
use keysweep_observe::metrics::{Counter, Gauge};
use keysweep_wire::{
    read_message, write_message, Assignment, Message, WireError,
};

use crate::allocator::WorkAllocator;
use crate::session::{NodeSession, SessionState};

/// Floor for the liveness scan period, so short test timeouts still scan
/// more than once per timeout window.
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Candidates per fresh allocation.
    pub work_size: i64,
    /// Candidates a node tests between checkpoints.
    pub checkpoint_interval: i64,
    /// Silence longer than this fails the session and reclaims its range.
    pub liveness_timeout: Duration,
    /// Zero disables the periodic metrics snapshot.
    pub metrics_snapshot_interval: Duration,
}

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    pub sessions_accepted_total: Counter,
    pub ranges_assigned_total: Counter,
    pub checkpoints_total: Counter,
    pub sessions_reclaimed_total: Counter,
    pub found_reports_total: Counter,
    pub active_sessions: Gauge,
    pub active_sessions_high_water: Gauge,
    pub reclaim_pool_depth: Gauge,
}

#[derive(Debug)]
struct ControllerState {
    allocator: WorkAllocator,
    sessions: BTreeMap<NodeId, NodeSession>,
    found: Option<MatchRecord>,
    next_node_id: u32,
}

#[derive(Clone)]
pub struct Controller {
    cfg: ControllerConfig,
    target: TargetFingerprint,
    state: Arc<Mutex<ControllerState>>,
    metrics: Arc<ControllerMetrics>,
    /// Wakes every session handler when the run is over.
    stop_tx: broadcast::Sender<()>,
    /// Carries the winning record out to `serve`.
    found_tx: Arc<watch::Sender<Option<MatchRecord>>>,
}

impl Controller {
    pub fn new(cfg: ControllerConfig, target: TargetFingerprint) -> Self {
        let (stop_tx, _) = broadcast::channel(4);
        let (found_tx, _) = watch::channel(None);
        Self {
            cfg,
            target,
            state: Arc::new(Mutex::new(ControllerState {
                allocator: WorkAllocator::new(),
                sessions: BTreeMap::new(),
                found: None,
                next_node_id: 0,
            })),
            metrics: Arc::new(ControllerMetrics::default()),
            stop_tx,
            found_tx: Arc::new(found_tx),
        }
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    /// Wakes every session handler with a STOP; used on interrupt.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Accepts nodes until the target is found, then stops every remaining
    /// session and returns the match record.
    pub async fn serve(self, listener: TcpListener) -> Result<Option<MatchRecord>> {
        let mut found_rx = self.found_tx.subscribe();

        let scan = tokio::spawn(self.clone().run_liveness_scan());
        let snapshot = if self.cfg.metrics_snapshot_interval > Duration::ZERO {
            Some(tokio::spawn(self.clone().run_metrics_snapshots()))
        } else {
            None
        };

        let record = loop {
            tokio::select! {
                changed = found_rx.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                    if let Some(record) = *found_rx.borrow_and_update() {
                        break Some(record);
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let controller = self.clone();
                            tokio::spawn(async move {
                                controller.handle_session(stream, peer).await;
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            }
        };

        scan.abort();
        if let Some(task) = snapshot {
            task.abort();
        }
        // Catch handlers that raced the winner's broadcast.
        let _ = self.stop_tx.send(());
        Ok(record)
    }

    async fn handle_session(self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "set_nodelay failed");
        }
        let (mut rd, mut wr) = stream.into_split();
        let node = self.register_session().await;
        info!(node_id = %node, peer = %peer, "node connected");

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    // Best-effort: the socket may already be gone, and the
                    // session was going to be reclaimed anyway.
                    let _ = write_message(&mut wr, &Message::Stop).await;
                    self.retire_session(node, SessionState::Disconnected, "run complete").await;
                    return;
                }
                read = timeout(self.cfg.liveness_timeout, read_message(&mut rd)) => {
                    match read {
                        Err(_elapsed) => {
                            self.retire_session(node, SessionState::TimedOut, "liveness timeout").await;
                            return;
                        }
                        Ok(Err(err)) => {
                            let (state, reason) = match &err {
                                WireError::Protocol(_) => (SessionState::Disconnected, "protocol error"),
                                WireError::ConnectionLost(_) => (SessionState::Disconnected, "connection lost"),
                            };
                            debug!(node_id = %node, error = %err, "session read failed");
                            self.retire_session(node, state, reason).await;
                            return;
                        }
                        Ok(Ok(msg)) => {
                            if !self.dispatch(node, msg, &mut wr).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handles one message; returns false once the session is finished.
    async fn dispatch(&self, node: NodeId, msg: Message, wr: &mut OwnedWriteHalf) -> bool {
        let (reply, close) = self.on_message(node, msg).await;
        if let Some(reply) = reply {
            if let Err(err) = write_message(wr, &reply).await {
                debug!(node_id = %node, error = %err, "session write failed");
                self.retire_session(node, SessionState::Disconnected, "write failed").await;
                return false;
            }
        }
        if close {
            self.retire_session(node, SessionState::Disconnected, "session complete").await;
            return false;
        }
        true
    }

    async fn register_session(&self) -> NodeId {
        let mut state = self.state.lock().await;
        let node = NodeId(state.next_node_id);
        state.next_node_id = state.next_node_id.wrapping_add(1);
        state.sessions.insert(node, NodeSession::new(node));
        self.metrics.sessions_accepted_total.inc();
        let active = state.sessions.len() as u64;
        self.metrics.active_sessions.set(active);
        self.metrics.active_sessions_high_water.max(active);
        node
    }

    /// The per-message state machine. Returns the reply (if any) and whether
    /// the connection should close afterwards.
    async fn on_message(&self, node: NodeId, msg: Message) -> (Option<Message>, bool) {
        let mut state = self.state.lock().await;
        let found = state.found.is_some();

        match msg {
            Message::Request => {
                if !state.sessions.contains_key(&node) {
                    // Swept by the liveness scan; closing makes the node
                    // reconnect as a fresh session.
                    return (None, true);
                }
                if found {
                    if let Some(sess) = state.sessions.get_mut(&node) {
                        sess.state = SessionState::FoundReported;
                    }
                    return (Some(Message::Stop), true);
                }
                let range = state.allocator.allocate(self.cfg.work_size);
                self.metrics.ranges_assigned_total.inc();
                self.metrics.reclaim_pool_depth.set(state.allocator.pool_depth() as u64);
                if let Some(sess) = state.sessions.get_mut(&node) {
                    sess.begin_assignment(range);
                }
                info!(
                    target: "keysweep_proof",
                    event = "range_assigned",
                    node_id = %node,
                    start = range.start,
                    end = range.end,
                    "range assigned"
                );
                (
                    Some(Message::Assign(Assignment {
                        node,
                        checkpoint_interval: self.cfg.checkpoint_interval,
                        range,
                        target: self.target.clone(),
                    })),
                    false,
                )
            }

            Message::Checkpoint(cp) => {
                if cp.node != node {
                    warn!(node_id = %node, claimed = %cp.node, "checkpoint carries a foreign node id");
                }
                let Some(sess) = state.sessions.get_mut(&node) else {
                    return (None, true);
                };
                sess.record_checkpoint(&cp.completed);
                self.metrics.checkpoints_total.inc();
                info!(
                    target: "keysweep_proof",
                    event = "checkpoint",
                    node_id = %node,
                    sub_ranges = cp.completed.len() as u64,
                    "checkpoint recorded"
                );
                if found {
                    (Some(Message::Stop), true)
                } else {
                    (Some(Message::Continue), false)
                }
            }

            Message::Found(report) => {
                self.metrics.found_reports_total.inc();
                if state.found.is_none() {
                    let record = MatchRecord {
                        node,
                        index: report.index,
                    };
                    state.found = Some(record);
                    if let Some(sess) = state.sessions.get_mut(&node) {
                        sess.state = SessionState::FoundReported;
                    }
                    info!(
                        target: "keysweep_proof",
                        event = "match_found",
                        node_id = %node,
                        index = report.index,
                        "match reported; stopping all sessions"
                    );
                    // Wake every other handler; each sends STOP on its own
                    // connection and closes it.
                    let _ = self.stop_tx.send(());
                    let _ = self.found_tx.send(Some(record));
                } else {
                    debug!(node_id = %node, index = report.index, "late FOUND ignored");
                }
                // The reporter's STOP doubles as its acknowledgment.
                (Some(Message::Stop), true)
            }

            // Controller-bound connections must never carry controller->node
            // kinds; treat it like any other protocol violation.
            other => {
                warn!(node_id = %node, kind = other.kind_name(), "unexpected message kind from node");
                (None, true)
            }
        }
    }

    /// The single funnel for session removal: every exit path lands here, and
    /// the unexhausted remainder is pooled before the session disappears.
    async fn retire_session(&self, node: NodeId, terminal: SessionState, reason: &str) {
        let mut state = self.state.lock().await;
        let Some(mut sess) = state.sessions.remove(&node) else {
            return;
        };
        sess.state = terminal;
        if let Some(assigned) = sess.assigned {
            let gaps = state.allocator.reclaim(assigned, &sess.checkpoints);
            self.metrics.sessions_reclaimed_total.inc();
            self.metrics.reclaim_pool_depth.set(state.allocator.pool_depth() as u64);
            info!(
                target: "keysweep_proof",
                event = "range_reclaimed",
                node_id = %node,
                start = assigned.start,
                end = assigned.end,
                gaps = gaps as u64,
                reason,
                "unexhausted remainder pooled"
            );
        } else {
            info!(node_id = %node, reason, "session closed");
        }
        self.metrics.active_sessions.set(state.sessions.len() as u64);
    }

    /// Sweeps sessions whose `last_seen` is past the timeout; identical to a
    /// disconnect. Handlers normally notice first via their read timeout; the
    /// scan bounds the damage if one is wedged on a write.
    async fn run_liveness_scan(self) {
        let period = (self.cfg.liveness_timeout / 2).max(MIN_SCAN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let stale: Vec<NodeId> = {
                let state = self.state.lock().await;
                state
                    .sessions
                    .values()
                    .filter(|s| s.idle_for() > self.cfg.liveness_timeout)
                    .map(|s| s.id)
                    .collect()
            };
            for node in stale {
                warn!(node_id = %node, "session exceeded liveness timeout");
                self.retire_session(node, SessionState::TimedOut, "liveness timeout").await;
            }
        }
    }

    async fn run_metrics_snapshots(self) {
        let mut ticker = tokio::time::interval(self.cfg.metrics_snapshot_interval);
        loop {
            ticker.tick().await;
            {
                let state = self.state.lock().await;
                self.metrics.active_sessions.set(state.sessions.len() as u64);
                self.metrics
                    .reclaim_pool_depth
                    .set(state.allocator.pool_depth() as u64);
            }
            info!(
                target: "keysweep_metrics",
                sessions_accepted_total = self.metrics.sessions_accepted_total.get(),
                ranges_assigned_total = self.metrics.ranges_assigned_total.get(),
                checkpoints_total = self.metrics.checkpoints_total.get(),
                sessions_reclaimed_total = self.metrics.sessions_reclaimed_total.get(),
                found_reports_total = self.metrics.found_reports_total.get(),
                active_sessions = self.metrics.active_sessions.get(),
                active_sessions_high_water = self.metrics.active_sessions_high_water.get(),
                reclaim_pool_depth = self.metrics.reclaim_pool_depth.get(),
                "metrics"
            );
        }
    }

    #[cfg(test)]
    async fn found_record(&self) -> Option<MatchRecord> {
        self.state.lock().await.found
    }
}
