//! Behaviour every checkpoint store must share, run against each backend.

use std::sync::Arc;

use ftpool_checkpoint::{
    Checkpoint, CheckpointInfo, CheckpointStore, InMemoryCheckpointStore, LoggedMessage, Reply,
    Request, RetentionPolicy, SqliteCheckpointStore, StateSnapshot, StoreError,
};
use ftpool_id::{GlobalStateIndex, Incarnation, SequenceNumber, UnitId};
use rstest::rstest;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

fn open(backend: Backend, retention: RetentionPolicy) -> Arc<dyn CheckpointStore> {
    match backend {
        Backend::Memory => Arc::new(InMemoryCheckpointStore::new(retention)),
        Backend::Sqlite => Arc::new(SqliteCheckpointStore::open_in_memory(retention).unwrap()),
    }
}

fn checkpoint(unit: UnitId, seq: u64, incarnation: u32) -> Checkpoint {
    Checkpoint::new(
        unit,
        SequenceNumber::new(seq),
        Incarnation::new(incarnation),
        StateSnapshot::new(1, format!("state-{seq}").into_bytes()),
        CheckpointInfo::default(),
    )
}

fn request(from: UnitId, to: UnitId, id: u64) -> Request {
    let mut req = Request::new(from, to, "work", id.to_le_bytes().to_vec());
    req.id = id;
    req
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn latest_only_keeps_newest(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();

    store.store_checkpoint(checkpoint(unit, 1, 1), Incarnation::FIRST).await.unwrap();
    store.store_checkpoint(checkpoint(unit, 2, 1), Incarnation::FIRST).await.unwrap();

    let last = store.last_checkpoint(unit).await.unwrap();
    assert_eq!(last.seq, SequenceNumber::new(2));
    assert_eq!(last.state.bytes, b"state-2");

    let err = store.checkpoint(unit, SequenceNumber::FIRST).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(
        store.history(unit).await.unwrap_err(),
        StoreError::NotSupported { .. }
    ));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn history_keeps_every_checkpoint(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::History);
    let unit = UnitId::new();

    for seq in 1..=3 {
        store.store_checkpoint(checkpoint(unit, seq, 1), Incarnation::FIRST).await.unwrap();
    }

    let second = store.checkpoint(unit, SequenceNumber::new(2)).await.unwrap();
    assert_eq!(second.state.bytes, b"state-2");

    let seqs: Vec<u64> = store
        .history(unit)
        .await
        .unwrap()
        .iter()
        .map(|c| c.seq.value())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let err = store
        .store_request(unit, request(UnitId::new(), unit, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotSupported { .. }));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn missing_unit_is_not_found(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();

    let err = store.last_checkpoint(unit).await.unwrap_err();
    assert_eq!(err, StoreError::NotFound { unit, seq: None });
    assert_eq!(store.incarnation(unit).await.unwrap(), Incarnation::FIRST);
    assert!(store.message_log(unit).await.unwrap().is_empty());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn messages_before_first_checkpoint_are_dropped(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();

    store.store_request(unit, request(UnitId::new(), unit, 1)).await.unwrap();
    assert!(store.message_log(unit).await.unwrap().is_empty());
    assert!(store.last_checkpoint(unit).await.unwrap_err().is_not_found());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn message_log_follows_latest_checkpoint(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();
    let peer = UnitId::new();

    store.store_checkpoint(checkpoint(unit, 1, 1), Incarnation::FIRST).await.unwrap();

    let req = request(peer, unit, 10);
    let outgoing = request(unit, peer, 3);
    let reply = Reply::to(&outgoing, b"done".to_vec());
    store.store_request(unit, req.clone()).await.unwrap();
    store.store_reply(unit, reply.clone()).await.unwrap();

    let log = store.message_log(unit).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.checkpoint_seq == SequenceNumber::FIRST));
    assert_eq!(log[0].message, LoggedMessage::Request(req));
    assert_eq!(log[1].message, LoggedMessage::Reply(reply));

    store.store_checkpoint(checkpoint(unit, 2, 1), Incarnation::FIRST).await.unwrap();
    assert!(store.message_log(unit).await.unwrap().is_empty());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn stale_incarnation_is_rejected(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();

    store.store_checkpoint(checkpoint(unit, 1, 1), Incarnation::FIRST).await.unwrap();
    store.fence(unit, Incarnation::new(2)).await.unwrap();

    let err = store
        .store_checkpoint(checkpoint(unit, 2, 1), Incarnation::FIRST)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::StaleIncarnation {
            unit,
            incarnation: Incarnation::FIRST,
            current: Incarnation::new(2),
        }
    );

    let last = store.last_checkpoint(unit).await.unwrap();
    assert_eq!(last.seq, SequenceNumber::FIRST);

    store
        .store_checkpoint(checkpoint(unit, 2, 2), Incarnation::new(2))
        .await
        .unwrap();
    assert_eq!(store.last_checkpoint(unit).await.unwrap().incarnation, Incarnation::new(2));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn newer_incarnation_raises_fence(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();

    store.store_checkpoint(checkpoint(unit, 1, 3), Incarnation::new(3)).await.unwrap();
    assert_eq!(store.incarnation(unit).await.unwrap(), Incarnation::new(3));

    let err = store
        .store_checkpoint(checkpoint(unit, 2, 2), Incarnation::new(2))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleIncarnation { .. }));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn sequence_must_advance(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::History);
    let unit = UnitId::new();

    store.store_checkpoint(checkpoint(unit, 2, 1), Incarnation::FIRST).await.unwrap();

    for seq in [1, 2] {
        let err = store
            .store_checkpoint(checkpoint(unit, seq, 1), Incarnation::FIRST)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::OutOfOrder {
                unit,
                seq: SequenceNumber::new(seq),
                last: SequenceNumber::new(2),
            }
        );
    }
    assert_eq!(store.history(unit).await.unwrap().len(), 1);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn global_state_tracks_slowest_unit(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let a = UnitId::new();
    let b = UnitId::new();

    let g = store.store_checkpoint(checkpoint(a, 1, 1), Incarnation::FIRST).await.unwrap();
    assert_eq!(g, GlobalStateIndex::new(1));

    let g = store.store_checkpoint(checkpoint(a, 2, 1), Incarnation::FIRST).await.unwrap();
    assert_eq!(g, GlobalStateIndex::new(2));

    // b is now the slowest unit; the index must not move back
    let g = store.store_checkpoint(checkpoint(b, 1, 1), Incarnation::FIRST).await.unwrap();
    assert_eq!(g, GlobalStateIndex::new(2));

    store.store_checkpoint(checkpoint(b, 2, 1), Incarnation::FIRST).await.unwrap();
    let g = store.store_checkpoint(checkpoint(b, 3, 1), Incarnation::FIRST).await.unwrap();
    assert_eq!(g, GlobalStateIndex::new(2));

    let g = store.store_checkpoint(checkpoint(a, 3, 1), Incarnation::FIRST).await.unwrap();
    assert_eq!(g, GlobalStateIndex::new(3));
    assert_eq!(store.global_state().await.unwrap(), GlobalStateIndex::new(3));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn concurrent_units_do_not_interfere(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let units: Vec<UnitId> = (0..8).map(|_| UnitId::new()).collect();

    let mut handles = Vec::new();
    for unit in units.clone() {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for seq in 1..=5 {
                store
                    .store_checkpoint(checkpoint(unit, seq, 1), Incarnation::FIRST)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for unit in units {
        assert_eq!(
            store.last_checkpoint(unit).await.unwrap().seq,
            SequenceNumber::new(5)
        );
    }
    assert_eq!(store.global_state().await.unwrap(), GlobalStateIndex::new(5));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn initialize_resets_store(#[case] backend: Backend) {
    let store = open(backend, RetentionPolicy::LatestOnly);
    let unit = UnitId::new();
    store.store_checkpoint(checkpoint(unit, 1, 1), Incarnation::FIRST).await.unwrap();
    store.fence(unit, Incarnation::new(4)).await.unwrap();

    store.initialize().await.unwrap();

    assert!(store.units().await.unwrap().is_empty());
    assert_eq!(store.incarnation(unit).await.unwrap(), Incarnation::FIRST);
    assert_eq!(store.global_state().await.unwrap(), GlobalStateIndex::NONE);
    store.store_checkpoint(checkpoint(unit, 1, 1), Incarnation::FIRST).await.unwrap();
}
