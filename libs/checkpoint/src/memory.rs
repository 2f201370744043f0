//! Process-local checkpoint store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ftpool_id::{GlobalStateIndex, Incarnation, SequenceNumber, UnitId};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::model::{Checkpoint, LoggedMessage, MessageLogEntry, Reply, Request};
use crate::store::{
    advance_global_state, CheckpointStore, RetentionPolicy, UnitSummary,
};

#[derive(Debug, Default)]
struct UnitSlot {
    /// Ordered by sequence; holds at most one entry under `LatestOnly`.
    checkpoints: BTreeMap<SequenceNumber, Checkpoint>,
    log: Vec<MessageLogEntry>,
    fence: Incarnation,
}

impl UnitSlot {
    fn last_seq(&self) -> SequenceNumber {
        self.checkpoints
            .keys()
            .next_back()
            .copied()
            .unwrap_or(SequenceNumber::ZERO)
    }
}

#[derive(Debug, Default)]
struct Inner {
    units: HashMap<UnitId, UnitSlot>,
    global: GlobalStateIndex,
}

impl Inner {
    fn lowest_latest(&self) -> Option<SequenceNumber> {
        self.units
            .values()
            .map(UnitSlot::last_seq)
            .filter(|seq| *seq > SequenceNumber::ZERO)
            .min()
    }
}

/// Checkpoint store held in memory.
///
/// One mutex guards all units, so writes to the same unit are serialized.
#[derive(Debug)]
pub struct InMemoryCheckpointStore {
    retention: RetentionPolicy,
    inner: Mutex<Inner>,
}

impl InMemoryCheckpointStore {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            retention,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::StorageUnavailable("store lock poisoned".to_string()))
    }

    fn append(&self, unit: UnitId, message: LoggedMessage) -> StoreResult<()> {
        if !self.capabilities().message_log {
            return Err(StoreError::NotSupported {
                operation: "store_message",
                policy: self.retention,
            });
        }

        let mut inner = self.lock()?;
        let Some(slot) = inner.units.get_mut(&unit) else {
            debug!(unit_id = %unit, kind = message.kind(), "No checkpoint yet, message not logged");
            return Ok(());
        };

        let checkpoint_seq = slot.last_seq();
        if checkpoint_seq == SequenceNumber::ZERO {
            debug!(unit_id = %unit, kind = message.kind(), "No checkpoint yet, message not logged");
            return Ok(());
        }

        slot.log.push(MessageLogEntry {
            checkpoint_seq,
            message,
        });
        Ok(())
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::LatestOnly)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    async fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        incarnation: Incarnation,
    ) -> StoreResult<GlobalStateIndex> {
        let unit = checkpoint.unit_id;
        let seq = checkpoint.seq;
        let mut inner = self.lock()?;

        let (fence, last) = inner
            .units
            .get(&unit)
            .map(|slot| (slot.fence, slot.last_seq()))
            .unwrap_or((Incarnation::FIRST, SequenceNumber::ZERO));
        if incarnation < fence {
            return Err(StoreError::StaleIncarnation {
                unit,
                incarnation,
                current: fence,
            });
        }
        if seq <= last {
            return Err(StoreError::OutOfOrder { unit, seq, last });
        }

        let slot = inner.units.entry(unit).or_default();
        slot.fence = slot.fence.max(incarnation);
        if self.retention == RetentionPolicy::LatestOnly {
            slot.checkpoints.clear();
        }
        slot.checkpoints.insert(seq, checkpoint);
        slot.log.clear();

        let global = advance_global_state(inner.global, inner.lowest_latest());
        inner.global = global;

        debug!(unit_id = %unit, seq = %seq, global = %global, "Stored checkpoint");
        Ok(global)
    }

    async fn last_checkpoint(&self, unit: UnitId) -> StoreResult<Checkpoint> {
        let inner = self.lock()?;
        inner
            .units
            .get(&unit)
            .and_then(|slot| slot.checkpoints.values().next_back())
            .cloned()
            .ok_or(StoreError::NotFound { unit, seq: None })
    }

    async fn checkpoint(&self, unit: UnitId, seq: SequenceNumber) -> StoreResult<Checkpoint> {
        let inner = self.lock()?;
        inner
            .units
            .get(&unit)
            .and_then(|slot| slot.checkpoints.get(&seq))
            .cloned()
            .ok_or(StoreError::NotFound {
                unit,
                seq: Some(seq),
            })
    }

    async fn history(&self, unit: UnitId) -> StoreResult<Vec<Checkpoint>> {
        if !self.capabilities().history {
            return Err(StoreError::NotSupported {
                operation: "history",
                policy: self.retention,
            });
        }
        let inner = self.lock()?;
        Ok(inner
            .units
            .get(&unit)
            .map(|slot| slot.checkpoints.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn store_request(&self, unit: UnitId, request: Request) -> StoreResult<()> {
        self.append(unit, LoggedMessage::Request(request))
    }

    async fn store_reply(&self, unit: UnitId, reply: Reply) -> StoreResult<()> {
        self.append(unit, LoggedMessage::Reply(reply))
    }

    async fn message_log(&self, unit: UnitId) -> StoreResult<Vec<MessageLogEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .units
            .get(&unit)
            .map(|slot| slot.log.clone())
            .unwrap_or_default())
    }

    async fn global_state(&self) -> StoreResult<GlobalStateIndex> {
        Ok(self.lock()?.global)
    }

    async fn incarnation(&self, unit: UnitId) -> StoreResult<Incarnation> {
        let inner = self.lock()?;
        Ok(inner
            .units
            .get(&unit)
            .map(|slot| slot.fence)
            .unwrap_or(Incarnation::FIRST))
    }

    async fn fence(&self, unit: UnitId, incarnation: Incarnation) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let slot = inner.units.entry(unit).or_default();
        slot.fence = slot.fence.max(incarnation);
        Ok(())
    }

    async fn units(&self) -> StoreResult<Vec<UnitSummary>> {
        let inner = self.lock()?;
        let mut units: Vec<UnitSummary> = inner
            .units
            .iter()
            .map(|(id, slot)| UnitSummary {
                unit_id: *id,
                last_seq: slot.last_seq(),
                incarnation: slot.fence,
                checkpoints: slot.checkpoints.len(),
                log_entries: slot.log.len(),
            })
            .collect();
        units.sort_by_key(|u| u.unit_id);
        Ok(units)
    }

    async fn initialize(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        *inner = Inner::default();
        debug!("Checkpoint store initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckpointInfo, StateSnapshot};

    fn checkpoint(unit: UnitId, seq: u64) -> Checkpoint {
        Checkpoint::new(
            unit,
            SequenceNumber::new(seq),
            Incarnation::FIRST,
            StateSnapshot::new(1, seq.to_le_bytes().to_vec()),
            CheckpointInfo::default(),
        )
    }

    #[tokio::test]
    async fn test_latest_only_replaces() {
        let store = InMemoryCheckpointStore::new(RetentionPolicy::LatestOnly);
        let unit = UnitId::new();

        store
            .store_checkpoint(checkpoint(unit, 1), Incarnation::FIRST)
            .await
            .unwrap();
        store
            .store_checkpoint(checkpoint(unit, 2), Incarnation::FIRST)
            .await
            .unwrap();

        let summary = store.units().await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].checkpoints, 1);
        assert_eq!(summary[0].last_seq, SequenceNumber::new(2));
    }

    #[tokio::test]
    async fn test_fence_never_lowers() {
        let store = InMemoryCheckpointStore::default();
        let unit = UnitId::new();

        store.fence(unit, Incarnation::new(3)).await.unwrap();
        store.fence(unit, Incarnation::new(2)).await.unwrap();
        assert_eq!(store.incarnation(unit).await.unwrap(), Incarnation::new(3));
    }

    #[tokio::test]
    async fn test_initialize_drops_everything() {
        let store = InMemoryCheckpointStore::default();
        let unit = UnitId::new();
        store
            .store_checkpoint(checkpoint(unit, 1), Incarnation::FIRST)
            .await
            .unwrap();

        store.initialize().await.unwrap();
        assert!(store.units().await.unwrap().is_empty());
        assert_eq!(store.global_state().await.unwrap(), GlobalStateIndex::NONE);
    }
}
