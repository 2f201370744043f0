//! What a unit needs to resume on a new node.

use ftpool_checkpoint::{Checkpoint, LoggedMessage, MessageLogEntry, Request};
use ftpool_id::{Incarnation, UnitId};

/// Everything the recovery side hands to a restarted unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPackage {
    pub checkpoint: Checkpoint,
    /// Messages logged after `checkpoint`, in arrival order.
    pub log: Vec<MessageLogEntry>,
    /// Incarnation that failed.
    pub previous_incarnation: Incarnation,
    /// Incarnation the store was fenced to for the restart.
    pub incarnation: Incarnation,
}

impl RestartPackage {
    pub fn new(checkpoint: Checkpoint, log: Vec<MessageLogEntry>, previous: Incarnation) -> Self {
        Self {
            checkpoint,
            log,
            previous_incarnation: previous,
            incarnation: previous.next(),
        }
    }

    pub fn unit(&self) -> UnitId {
        self.checkpoint.unit_id
    }

    /// Logged messages that belong to the restored checkpoint.
    pub fn replay(&self) -> Vec<LoggedMessage> {
        self.log
            .iter()
            .filter(|entry| entry.checkpoint_seq == self.checkpoint.seq)
            .map(|entry| entry.message.clone())
            .collect()
    }
}

/// Work a restored unit does before serving new messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartPlan {
    /// Messages to deliver again, in their original order.
    pub replay: Vec<LoggedMessage>,
    /// Outgoing requests that were never answered and must be sent again.
    pub resend: Vec<Request>,
}
