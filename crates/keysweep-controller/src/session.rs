use std::time::{Duration, Instant};

use keysweep_core::types::{IndexRange, NodeId};

/// Lifecycle of one node session. Terminal states are recorded just before
/// the session leaves the map, so logs can say why it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, waiting for the node's first REQUEST.
    Connected,
    /// Holds a range.
    Assigned,
    /// Holds a range and has reported at least one checkpoint against it.
    Checkpointed,
    /// Told to stop because the target was found.
    FoundReported,
    /// Went silent past the liveness timeout.
    TimedOut,
    /// Socket closed or sent garbage.
    Disconnected,
}

/// Controller-side view of one connected node. Owned exclusively by the
/// session manager; created on accept, destroyed on disconnect, timeout, or
/// shutdown.
#[derive(Debug)]
pub struct NodeSession {
    pub id: NodeId,
    pub state: SessionState,
    pub assigned: Option<IndexRange>,
    /// Sub-ranges of `assigned` the node has confirmed exhausted.
    pub checkpoints: Vec<IndexRange>,
    pub last_seen: Instant,
}

impl NodeSession {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            assigned: None,
            checkpoints: Vec::new(),
            last_seen: Instant::now(),
        }
    }

    /// A fresh assignment replaces the previous one entirely; the checkpoint
    /// record is relative to the current range.
    pub fn begin_assignment(&mut self, range: IndexRange) {
        self.assigned = Some(range);
        self.checkpoints.clear();
        self.state = SessionState::Assigned;
        self.touch();
    }

    pub fn record_checkpoint(&mut self, completed: &[IndexRange]) {
        self.checkpoints.extend_from_slice(completed);
        self.state = SessionState::Checkpointed;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_assignment_resets_the_checkpoint_record() {
        let mut s = NodeSession::new(NodeId(1));
        s.begin_assignment(IndexRange { start: 0, end: 99 });
        s.record_checkpoint(&[IndexRange { start: 0, end: 49 }]);
        assert_eq!(s.state, SessionState::Checkpointed);
        assert_eq!(s.checkpoints.len(), 1);

        s.begin_assignment(IndexRange { start: 100, end: 199 });
        assert!(s.checkpoints.is_empty());
        assert_eq!(s.state, SessionState::Assigned);
    }
}
