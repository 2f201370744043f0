//! Node records and the events a node source publishes.

use std::fmt;

use chrono::{DateTime, Utc};
use ftpool_id::{DeploymentId, NodeUrl, UnitId};
use serde::Serialize;

/// Lifecycle of a node inside a node source.
///
/// ```text
/// Adding -> Up -> {Down, ToBeReleased} -> Removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// URL accepted, runtime being resolved.
    Adding,
    /// Usable.
    Up,
    /// Failed a liveness probe.
    Down,
    /// Leaves the pool once its current work completes.
    ToBeReleased,
    /// Gone from the pool.
    Removed,
}

impl NodeState {
    /// States the liveness monitor probes.
    pub fn is_probed(self) -> bool {
        matches!(self, NodeState::Up | NodeState::ToBeReleased)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Adding => "adding",
            NodeState::Up => "up",
            NodeState::Down => "down",
            NodeState::ToBeReleased => "to_be_released",
            NodeState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A worker node owned by a node source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub url: NodeUrl,
    /// Name of the owning node source.
    pub source: String,
    pub state: NodeState,
    /// Unit currently placed on the node.
    pub hosted: Option<UnitId>,
    pub added_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(url: NodeUrl, source: impl Into<String>) -> Self {
        Self {
            url,
            source: source.into(),
            state: NodeState::Adding,
            hosted: None,
            added_at: Utc::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == NodeState::Up && self.hosted.is_none()
    }
}

/// Why a node left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The registry asked for it.
    Requested,
    /// It stopped answering pings.
    Down,
    /// Preemptive shutdown.
    Preempted,
}

/// Entry of the removed-nodes history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedNode {
    pub url: NodeUrl,
    pub reason: RemovalReason,
    pub hosted: Option<UnitId>,
    pub removed_at: DateTime<Utc>,
}

/// Point-in-time summary of a node source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSourceStatus {
    pub name: String,
    pub adding: usize,
    pub up: usize,
    pub to_be_released: usize,
    pub hosting: usize,
    pub removed: usize,
    pub deployments: Vec<DeploymentId>,
    pub shutting_down: bool,
    pub terminated: bool,
}

impl NodeSourceStatus {
    /// Nodes still owned by the source.
    pub fn total(&self) -> usize {
        self.adding + self.up + self.to_be_released
    }
}

/// Published on every change of a node source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added {
        url: NodeUrl,
    },
    Removed {
        url: NodeUrl,
        reason: RemovalReason,
    },
    /// The node was found down; `hosted` is the unit it carried, if any.
    Down {
        url: NodeUrl,
        hosted: Option<UnitId>,
    },
    ReleasePending {
        url: NodeUrl,
    },
    Terminated,
}
