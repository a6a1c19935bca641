//! The node's controller client: the handshake, the checkpoint coordinator,
//! and bounded reconnect. This is the only place the node touches the
//! network; search threads never block on IO.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use keysweep_core::enumerate::Enumerator;
use keysweep_core::types::{IndexRange, NodeId};
use keysweep_core::verify::{verifier_for, Verifier};
use keysweep_observe::time::unix_time_ms;
use keysweep_wire::{
    read_message, write_message, Assignment, CheckpointReport, FoundReport, Message, WireError,
};

use crate::pool::SearchPool;

/// How often the checkpoint coordinator samples thread progress.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(25);

const BASE_CONNECT_DELAY_MS: u64 = 200;
const MAX_CONNECT_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Controller `host:port`.
    pub controller_addr: String,
    /// Parallel search threads per assignment.
    pub threads: usize,
    /// Connection attempts (initial or after a lost connection) before
    /// giving up.
    pub connect_retries: usize,
    /// How long to wait for any controller reply.
    pub reply_timeout: Duration,
}

/// How a node run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The controller said stop: someone found the target, or shutdown.
    Stopped,
    /// This node found the target at the given index.
    Found(i64),
}

enum AssignmentOutcome {
    Exhausted,
    Stopped,
    Found(i64),
}

enum CheckpointReply {
    Continue,
    Stop,
}

pub struct NodeClient {
    cfg: NodeConfig,
    enumerator: Arc<dyn Enumerator>,
}

impl NodeClient {
    pub fn new(cfg: NodeConfig, enumerator: Arc<dyn Enumerator>) -> Self {
        Self { cfg, enumerator }
    }

    /// Works ranges until the controller stops us, this node finds the
    /// target, or the controller becomes unreachable past the retry budget.
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut reconnects = 0usize;
        loop {
            let mut stream =
                connect_with_backoff(&self.cfg.controller_addr, self.cfg.connect_retries).await?;
            match self.drive_connection(&mut stream).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_connection_lost(&err) && reconnects < self.cfg.connect_retries => {
                    reconnects += 1;
                    warn!(
                        reconnects,
                        error = %err,
                        "connection to controller lost; reconnecting"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn drive_connection(&self, stream: &mut TcpStream) -> Result<RunOutcome> {
        loop {
            write_message(stream, &Message::Request).await?;
            let msg = timeout(self.cfg.reply_timeout, read_message(stream))
                .await
                .map_err(|_| reply_timed_out("an assignment"))??;

            match msg {
                Message::Assign(assignment) => {
                    info!(
                        target: "keysweep_proof",
                        event = "range_received",
                        node_id = %assignment.node,
                        start = assignment.range.start,
                        end = assignment.range.end,
                        "assignment received"
                    );
                    match self.run_assignment(stream, assignment).await? {
                        AssignmentOutcome::Exhausted => continue,
                        AssignmentOutcome::Stopped => return Ok(RunOutcome::Stopped),
                        AssignmentOutcome::Found(index) => return Ok(RunOutcome::Found(index)),
                    }
                }
                Message::Stop => return Ok(RunOutcome::Stopped),
                other => anyhow::bail!(
                    "controller sent {} while an assignment was expected",
                    other.kind_name()
                ),
            }
        }
    }

    async fn run_assignment(
        &self,
        stream: &mut TcpStream,
        assignment: Assignment,
    ) -> Result<AssignmentOutcome> {
        let verifier: Arc<dyn Verifier> = Arc::from(
            verifier_for(&assignment.target).context("cannot verify this fingerprint")?,
        );
        let mut pool = SearchPool::launch(
            assignment.range,
            self.cfg.threads,
            self.enumerator.clone(),
            verifier,
            assignment.target.clone(),
        );
        let mut reported: Vec<i64> = pool.sub_ranges().iter().map(|s| s.start).collect();

        let outcome = self
            .coordinate_checkpoints(stream, &assignment, &pool, &mut reported)
            .await;

        // Whatever happened on the wire, wind the threads down before leaving.
        pool.stop();
        pool.join().await;

        match outcome? {
            AssignmentOutcome::Found(index) => {
                info!(
                    target: "keysweep_proof",
                    event = "match_found",
                    node_id = %assignment.node,
                    index,
                    "reporting match"
                );
                let report = Message::Found(FoundReport {
                    node: assignment.node,
                    index,
                });
                match write_message(stream, &report).await {
                    Ok(()) => {
                        // The controller acknowledges with a STOP; the run is
                        // over either way, so a lost connection here is fine.
                        let _ = timeout(self.cfg.reply_timeout, read_message(stream)).await;
                    }
                    Err(err) => {
                        // Keep the local result; the controller reclaims the
                        // range and the index will be re-verified elsewhere.
                        warn!(error = %err, "failed to report the match upstream");
                    }
                }
                Ok(AssignmentOutcome::Found(index))
            }
            other => Ok(other),
        }
    }

    /// The coordinator loop: samples thread progress, reports at the
    /// configured candidate interval, and blocks on each reply.
    async fn coordinate_checkpoints(
        &self,
        stream: &mut TcpStream,
        assignment: &Assignment,
        pool: &SearchPool,
        reported: &mut [i64],
    ) -> Result<AssignmentOutcome> {
        let interval = assignment.checkpoint_interval as u64;
        let mut tested_at_last_report = 0u64;

        loop {
            tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;

            if let Some(index) = pool.found_index() {
                return Ok(AssignmentOutcome::Found(index));
            }

            if pool.is_idle() {
                // Batch complete: one final checkpoint for the trailing
                // sub-ranges, even if every index was already reported.
                let completed = collect_completed(pool, reported);
                return match self.checkpoint(stream, assignment.node, completed).await? {
                    CheckpointReply::Continue => Ok(AssignmentOutcome::Exhausted),
                    CheckpointReply::Stop => Ok(AssignmentOutcome::Stopped),
                };
            }

            let tested = pool.tested();
            if tested.saturating_sub(tested_at_last_report) >= interval {
                let completed = collect_completed(pool, reported);
                tested_at_last_report = tested;
                if completed.is_empty() {
                    continue;
                }
                if let CheckpointReply::Stop =
                    self.checkpoint(stream, assignment.node, completed).await?
                {
                    return Ok(AssignmentOutcome::Stopped);
                }
            }
        }
    }

    async fn checkpoint(
        &self,
        stream: &mut TcpStream,
        node: NodeId,
        completed: Vec<IndexRange>,
    ) -> Result<CheckpointReply> {
        write_message(
            stream,
            &Message::Checkpoint(CheckpointReport { node, completed }),
        )
        .await?;
        let reply = timeout(self.cfg.reply_timeout, read_message(stream))
            .await
            .map_err(|_| reply_timed_out("a checkpoint reply"))??;
        match reply {
            Message::Continue => Ok(CheckpointReply::Continue),
            Message::Stop => Ok(CheckpointReply::Stop),
            other => anyhow::bail!(
                "controller sent {} in reply to a checkpoint",
                other.kind_name()
            ),
        }
    }
}

/// Newly exhausted sub-ranges since the previous report, one per thread,
/// advancing each thread's reported boundary.
fn collect_completed(pool: &SearchPool, reported: &mut [i64]) -> Vec<IndexRange> {
    let mut out = Vec::new();
    for (i, sub) in pool.sub_ranges().iter().enumerate() {
        let boundary = pool.boundary(i).min(sub.end + 1);
        if boundary > reported[i] {
            out.push(IndexRange {
                start: reported[i],
                end: boundary - 1,
            });
            reported[i] = boundary;
        }
    }
    out
}

async fn connect_with_backoff(addr: &str, retries: usize) -> Result<TcpStream> {
    let mut attempt = 0usize;
    let mut delay_ms = BASE_CONNECT_DELAY_MS;
    loop {
        attempt += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(error = %err, "set_nodelay failed");
                }
                info!(addr, "connected to controller");
                return Ok(stream);
            }
            Err(err) if attempt <= retries => {
                let jitter = unix_time_ms() % 37;
                warn!(attempt, error = %err, "controller unreachable; retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter))).await;
                delay_ms = delay_ms.saturating_mul(2).min(MAX_CONNECT_DELAY_MS);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("controller {addr} unreachable after {attempt} attempts")))
            }
        }
    }
}

/// A silent controller is indistinguishable from a dead one; both feed the
/// bounded reconnect budget.
fn reply_timed_out(waiting_for: &str) -> WireError {
    WireError::ConnectionLost(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("timed out waiting for {waiting_for}"),
    ))
}

fn is_connection_lost(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<WireError>(),
        Some(WireError::ConnectionLost(_))
    )
}
