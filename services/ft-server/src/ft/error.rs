use ftpool_checkpoint::StoreError;
use ftpool_id::UnitId;
use thiserror::Error;

use super::capture::CaptureError;
use super::transport::TransportError;

/// Errors surfaced by a fault-tolerance manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FtError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// The destination was declared down while a send was being retried.
    #[error("destination unit {0} is down")]
    DestinationDown(UnitId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol and store do not fit together.
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}
