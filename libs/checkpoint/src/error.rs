//! Error types for checkpoint storage.

use ftpool_id::{Incarnation, SequenceNumber, UnitId};
use thiserror::Error;

use crate::store::RetentionPolicy;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from checkpoint store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No checkpoint exists for the unit (or for the requested sequence).
    #[error("no checkpoint for unit {unit}{}", seq.map(|s| format!(" at sequence {s}")).unwrap_or_default())]
    NotFound {
        unit: UnitId,
        seq: Option<SequenceNumber>,
    },

    /// The store's retention policy does not support the operation.
    #[error("operation '{operation}' is not supported with {policy} retention")]
    NotSupported {
        operation: &'static str,
        policy: RetentionPolicy,
    },

    /// The storage layer failed or did not answer in time.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A write came from an incarnation that has been superseded by recovery.
    #[error("stale incarnation {incarnation} for unit {unit} (current is {current})")]
    StaleIncarnation {
        unit: UnitId,
        incarnation: Incarnation,
        current: Incarnation,
    },

    /// A checkpoint did not advance the unit's sequence number.
    #[error("checkpoint {seq} for unit {unit} does not follow stored checkpoint {last}")]
    OutOfOrder {
        unit: UnitId,
        seq: SequenceNumber,
        last: SequenceNumber,
    },

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns true if the error means "nothing stored".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Returns true if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StorageUnavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
