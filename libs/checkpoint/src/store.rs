//! The checkpoint store contract.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ftpool_id::{GlobalStateIndex, Incarnation, SequenceNumber, UnitId};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::{Checkpoint, MessageLogEntry, Reply, Request};

/// How many checkpoints a store keeps per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the newest checkpoint and the messages received after it.
    LatestOnly,
    /// Keep every checkpoint, addressable by sequence number.
    History,
}

impl RetentionPolicy {
    pub fn capabilities(self) -> StoreCapabilities {
        match self {
            RetentionPolicy::LatestOnly => StoreCapabilities {
                history: false,
                message_log: true,
            },
            RetentionPolicy::History => StoreCapabilities {
                history: true,
                message_log: false,
            },
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::LatestOnly => write!(f, "latest-only"),
            RetentionPolicy::History => write!(f, "history"),
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" | "latest-only" | "latest_only" => Ok(RetentionPolicy::LatestOnly),
            "history" => Ok(RetentionPolicy::History),
            other => Err(format!("unknown retention policy: {other}")),
        }
    }
}

/// Features a store supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// Older checkpoints can be fetched by sequence number.
    pub history: bool,
    /// Requests and replies can be logged against the latest checkpoint.
    pub message_log: bool,
}

/// Per-unit overview, as listed by [`CheckpointStore::units`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit_id: UnitId,
    pub last_seq: SequenceNumber,
    pub incarnation: Incarnation,
    pub checkpoints: usize,
    pub log_entries: usize,
}

/// Durable storage for checkpoints and message logs.
///
/// Implementations serialize writes to the same unit and stay safe under
/// concurrent calls for different units.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retention policy the store was opened with.
    fn retention(&self) -> RetentionPolicy;

    fn capabilities(&self) -> StoreCapabilities {
        self.retention().capabilities()
    }

    /// Persists `checkpoint` on behalf of `incarnation` and returns the
    /// global state index after the write.
    ///
    /// Rejects writes from an incarnation below the unit's fence and
    /// checkpoints whose sequence does not exceed the stored one. Nothing
    /// is written when the call fails.
    async fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        incarnation: Incarnation,
    ) -> StoreResult<GlobalStateIndex>;

    /// Newest checkpoint of `unit`.
    async fn last_checkpoint(&self, unit: UnitId) -> StoreResult<Checkpoint>;

    /// Checkpoint `seq` of `unit`.
    ///
    /// With `LatestOnly` retention only the newest sequence can be found.
    async fn checkpoint(&self, unit: UnitId, seq: SequenceNumber) -> StoreResult<Checkpoint>;

    /// Every retained checkpoint of `unit`, oldest first. `History` only.
    async fn history(&self, unit: UnitId) -> StoreResult<Vec<Checkpoint>>;

    /// Appends a received request to the log of the unit's latest
    /// checkpoint. A unit that never checkpointed logs nothing.
    async fn store_request(&self, unit: UnitId, request: Request) -> StoreResult<()>;

    /// Appends a received reply, same rules as [`store_request`](Self::store_request).
    async fn store_reply(&self, unit: UnitId, reply: Reply) -> StoreResult<()>;

    /// Messages logged since the unit's latest checkpoint, in arrival order.
    async fn message_log(&self, unit: UnitId) -> StoreResult<Vec<MessageLogEntry>>;

    /// Current global state index.
    async fn global_state(&self) -> StoreResult<GlobalStateIndex>;

    /// Lowest incarnation the store accepts writes from for `unit`.
    async fn incarnation(&self, unit: UnitId) -> StoreResult<Incarnation>;

    /// Raises the fence of `unit` to `incarnation`. Never lowers it.
    async fn fence(&self, unit: UnitId, incarnation: Incarnation) -> StoreResult<()>;

    /// Every unit the store knows, ordered by id.
    async fn units(&self) -> StoreResult<Vec<UnitSummary>>;

    /// Drops everything. Used when an application starts from scratch.
    async fn initialize(&self) -> StoreResult<()>;
}

/// Folds the newest per-unit sequences into the global state index.
///
/// The index only moves forward and never passes a unit that has not
/// reached it.
pub(crate) fn advance_global_state(
    current: GlobalStateIndex,
    lowest_latest: Option<SequenceNumber>,
) -> GlobalStateIndex {
    match lowest_latest {
        Some(seq) if seq.value() > current.value() => GlobalStateIndex::new(seq.value()),
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_capabilities() {
        let latest = RetentionPolicy::LatestOnly.capabilities();
        assert!(latest.message_log);
        assert!(!latest.history);

        let history = RetentionPolicy::History.capabilities();
        assert!(history.history);
        assert!(!history.message_log);
    }

    #[test]
    fn test_retention_from_str() {
        assert_eq!(
            "latest".parse::<RetentionPolicy>().unwrap(),
            RetentionPolicy::LatestOnly
        );
        assert_eq!(
            "History".parse::<RetentionPolicy>().unwrap(),
            RetentionPolicy::History
        );
        assert!("forever".parse::<RetentionPolicy>().is_err());
    }

    #[test]
    fn test_global_state_only_advances() {
        let g = GlobalStateIndex::new(3);
        assert_eq!(advance_global_state(g, None), g);
        assert_eq!(advance_global_state(g, Some(SequenceNumber::new(2))), g);
        assert_eq!(
            advance_global_state(g, Some(SequenceNumber::new(5))),
            GlobalStateIndex::new(5)
        );
    }
}
