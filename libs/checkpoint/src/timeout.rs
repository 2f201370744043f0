//! Time-bounded wrapper around another store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ftpool_id::{GlobalStateIndex, Incarnation, SequenceNumber, UnitId};
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::model::{Checkpoint, MessageLogEntry, Reply, Request};
use crate::store::{CheckpointStore, RetentionPolicy, StoreCapabilities, UnitSummary};

/// Fails any call on the inner store that takes longer than `limit` with
/// [`StoreError::StorageUnavailable`].
///
/// A timed-out write may still complete in the background; callers treat
/// it as failed and retry with a higher sequence number.
pub struct TimeoutStore<S: ?Sized> {
    inner: Arc<S>,
    limit: Duration,
}

impl<S: CheckpointStore + ?Sized> TimeoutStore<S> {
    pub fn new(inner: Arc<S>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    limit_ms = self.limit.as_millis() as u64,
                    "Checkpoint store call timed out"
                );
                Err(StoreError::StorageUnavailable(format!(
                    "{operation} did not complete within {:?}",
                    self.limit
                )))
            }
        }
    }
}

#[async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for TimeoutStore<S> {
    fn retention(&self) -> RetentionPolicy {
        self.inner.retention()
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    async fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        incarnation: Incarnation,
    ) -> StoreResult<GlobalStateIndex> {
        self.bounded(
            "store_checkpoint",
            self.inner.store_checkpoint(checkpoint, incarnation),
        )
        .await
    }

    async fn last_checkpoint(&self, unit: UnitId) -> StoreResult<Checkpoint> {
        self.bounded("last_checkpoint", self.inner.last_checkpoint(unit))
            .await
    }

    async fn checkpoint(&self, unit: UnitId, seq: SequenceNumber) -> StoreResult<Checkpoint> {
        self.bounded("checkpoint", self.inner.checkpoint(unit, seq))
            .await
    }

    async fn history(&self, unit: UnitId) -> StoreResult<Vec<Checkpoint>> {
        self.bounded("history", self.inner.history(unit)).await
    }

    async fn store_request(&self, unit: UnitId, request: Request) -> StoreResult<()> {
        self.bounded("store_request", self.inner.store_request(unit, request))
            .await
    }

    async fn store_reply(&self, unit: UnitId, reply: Reply) -> StoreResult<()> {
        self.bounded("store_reply", self.inner.store_reply(unit, reply))
            .await
    }

    async fn message_log(&self, unit: UnitId) -> StoreResult<Vec<MessageLogEntry>> {
        self.bounded("message_log", self.inner.message_log(unit))
            .await
    }

    async fn global_state(&self) -> StoreResult<GlobalStateIndex> {
        self.bounded("global_state", self.inner.global_state()).await
    }

    async fn incarnation(&self, unit: UnitId) -> StoreResult<Incarnation> {
        self.bounded("incarnation", self.inner.incarnation(unit))
            .await
    }

    async fn fence(&self, unit: UnitId, incarnation: Incarnation) -> StoreResult<()> {
        self.bounded("fence", self.inner.fence(unit, incarnation))
            .await
    }

    async fn units(&self) -> StoreResult<Vec<UnitSummary>> {
        self.bounded("units", self.inner.units()).await
    }

    async fn initialize(&self) -> StoreResult<()> {
        self.bounded("initialize", self.inner.initialize()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCheckpointStore;

    struct StalledStore;

    #[async_trait]
    impl CheckpointStore for StalledStore {
        fn retention(&self) -> RetentionPolicy {
            RetentionPolicy::LatestOnly
        }

        async fn store_checkpoint(
            &self,
            _checkpoint: Checkpoint,
            _incarnation: Incarnation,
        ) -> StoreResult<GlobalStateIndex> {
            std::future::pending().await
        }

        async fn last_checkpoint(&self, _unit: UnitId) -> StoreResult<Checkpoint> {
            std::future::pending().await
        }

        async fn checkpoint(&self, _u: UnitId, _s: SequenceNumber) -> StoreResult<Checkpoint> {
            std::future::pending().await
        }

        async fn history(&self, _unit: UnitId) -> StoreResult<Vec<Checkpoint>> {
            std::future::pending().await
        }

        async fn store_request(&self, _unit: UnitId, _request: Request) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn store_reply(&self, _unit: UnitId, _reply: Reply) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn message_log(&self, _unit: UnitId) -> StoreResult<Vec<MessageLogEntry>> {
            std::future::pending().await
        }

        async fn global_state(&self) -> StoreResult<GlobalStateIndex> {
            std::future::pending().await
        }

        async fn incarnation(&self, _unit: UnitId) -> StoreResult<Incarnation> {
            std::future::pending().await
        }

        async fn fence(&self, _unit: UnitId, _incarnation: Incarnation) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn units(&self) -> StoreResult<Vec<UnitSummary>> {
            std::future::pending().await
        }

        async fn initialize(&self) -> StoreResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_becomes_unavailable() {
        let store = TimeoutStore::new(Arc::new(StalledStore), Duration::from_secs(5));
        let err = store.last_checkpoint(UnitId::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_passes_through_results() {
        let inner: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::default());
        let store = TimeoutStore::new(inner, Duration::from_secs(5));
        let err = store.last_checkpoint(UnitId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
