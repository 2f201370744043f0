//! The seam between the fault-tolerance layer and a unit's state.

use async_trait::async_trait;
use ftpool_checkpoint::StateSnapshot;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("state capture failed: {0}")]
    Snapshot(String),

    #[error("unsupported state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("state restore failed: {0}")]
    Restore(String),
}

/// Implemented by every unit type that can be checkpointed.
///
/// The snapshot format belongs to the unit; the version lets a unit refuse
/// to restore a state it does not understand.
#[async_trait]
pub trait StateCapture: Send + Sync {
    async fn snapshot(&self) -> Result<StateSnapshot, CaptureError>;

    async fn restore(&self, snapshot: &StateSnapshot) -> Result<(), CaptureError>;
}
