mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{url, Behavior, FakeRestarter, Pool};
use ftpool_checkpoint::{
    Checkpoint, CheckpointInfo, CheckpointStore, InMemoryCheckpointStore, RetentionPolicy,
    StateSnapshot,
};
use ftpool_id::{Incarnation, SequenceNumber, UnitId};
use ftpool_server::backoff::BackoffPolicy;
use ftpool_server::directory::{InMemoryDirectory, UnitDirectory, UnitHealth};
use ftpool_server::failover::{adopt_checkpointed_units, FailureRouter};
use ftpool_server::liveness::{LivenessConfig, LivenessMonitor};
use ftpool_server::nodesource::NodeEvent;
use ftpool_server::recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryError, RecoveryOutcome};
use tokio::sync::watch;

struct Harness {
    pool: Pool,
    store: Arc<InMemoryCheckpointStore>,
    directory: Arc<InMemoryDirectory>,
    restarter: Arc<FakeRestarter>,
    router: FailureRouter,
}

impl Harness {
    async fn new(nodes: &[&str]) -> Self {
        let pool = Pool::with_nodes(nodes).await;
        let store = Arc::new(InMemoryCheckpointStore::new(RetentionPolicy::LatestOnly));
        let directory = Arc::new(InMemoryDirectory::new(
            Arc::new(pool.nodes.clone()),
            Duration::from_secs(1),
        ));
        let restarter = FakeRestarter::new();
        let coordinator = Arc::new(RecoveryCoordinator::new(
            store.clone(),
            Arc::new(pool.source.clone()),
            restarter.clone(),
            directory.clone(),
            RecoveryConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy::constant(Duration::from_secs(1)),
            },
        ));
        let router = FailureRouter::new(coordinator, directory.clone());
        Self {
            pool,
            store,
            directory,
            restarter,
            router,
        }
    }

    /// Places a unit on a node of the pool, optionally with a checkpoint.
    async fn place_unit(&self, checkpointed: bool) -> (UnitId, ftpool_id::NodeUrl) {
        let unit = UnitId::new();
        let node = self
            .pool
            .source
            .acquire_free_node(unit)
            .await
            .unwrap()
            .unwrap();
        self.directory.register(unit, node.url.clone()).await;

        if checkpointed {
            let checkpoint = Checkpoint::new(
                unit,
                SequenceNumber::FIRST,
                Incarnation::FIRST,
                StateSnapshot::new(1, b"{}".to_vec()),
                CheckpointInfo::default(),
            );
            self.store
                .store_checkpoint(checkpoint, Incarnation::FIRST)
                .await
                .unwrap();
        }
        (unit, node.url)
    }
}

#[tokio::test(start_paused = true)]
async fn down_node_units_are_recovered() {
    let mut h = Harness::new(&["a", "b"]).await;
    let (unit, host) = h.place_unit(true).await;
    h.pool.nodes.set(&host, Behavior::Dead);

    let scheduled = h
        .router
        .handle_event(&NodeEvent::Down {
            url: host.clone(),
            hosted: Some(unit),
        })
        .await;
    assert_eq!(scheduled, vec![unit]);

    let finished = h.router.wait_idle().await;
    assert_eq!(finished.len(), 1);
    let (recovered, result) = &finished[0];
    assert_eq!(*recovered, unit);
    assert!(matches!(result, Ok(RecoveryOutcome::Restarted { .. })));

    let location = h.directory.location(unit).await.unwrap();
    assert_ne!(location, host);
    assert_eq!(h.directory.health(unit).await, Some(UnitHealth::Alive));
    assert_eq!(h.restarter.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_unit_is_marked_failed() {
    let mut h = Harness::new(&["a", "b"]).await;
    let (unit, host) = h.place_unit(false).await;
    h.pool.nodes.set(&host, Behavior::Dead);

    h.router
        .handle_event(&NodeEvent::Down {
            url: host,
            hosted: Some(unit),
        })
        .await;
    let finished = h.router.wait_idle().await;

    assert_eq!(finished[0].1, Err(RecoveryError::NoCheckpoint(unit)));
    assert_eq!(h.directory.health(unit).await, Some(UnitHealth::Failed));
    let failure = h.directory.failure(unit).await.unwrap();
    assert!(failure.reason.contains("no checkpoint"));
}

#[tokio::test(start_paused = true)]
async fn other_events_are_ignored() {
    let mut h = Harness::new(&["a"]).await;

    let scheduled = h
        .router
        .handle_event(&NodeEvent::Added { url: url("a") })
        .await;
    assert!(scheduled.is_empty());

    let scheduled = h
        .router
        .handle_event(&NodeEvent::Down {
            url: url("a"),
            hosted: None,
        })
        .await;
    assert!(scheduled.is_empty());
    assert_eq!(h.router.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn liveness_failure_moves_unit_to_another_node() {
    let h = Harness::new(&["a", "b"]).await;
    let (unit, host) = h.place_unit(true).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let Harness {
        pool,
        directory,
        router,
        ..
    } = h;
    let router_task = tokio::spawn(router.run(pool.source.subscribe(), shutdown_rx));

    pool.nodes.set(&host, Behavior::Dead);
    let mut monitor = LivenessMonitor::new(
        pool.source.clone(),
        LivenessConfig {
            interval: Duration::from_secs(10),
            threshold: 1,
            probe_timeout: Duration::from_secs(1),
        },
    );
    assert_eq!(monitor.probe_once().await.unwrap(), vec![host.clone()]);

    tokio::time::timeout(Duration::from_secs(30), async {
        while directory.location(unit).await.as_ref() == Some(&host) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("unit should move");

    let survivor = pool.source.up_nodes().await.unwrap();
    assert_eq!(survivor.len(), 1);
    assert_eq!(directory.location(unit).await, Some(survivor[0].url.clone()));
    assert_eq!(survivor[0].hosted, Some(unit));

    shutdown_tx.send(true).unwrap();
    router_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn router_stops_with_the_node_source() {
    let h = Harness::new(&["a"]).await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let Harness { pool, router, .. } = h;

    let task = tokio::spawn(router.run(pool.source.subscribe(), shutdown_rx));
    pool.source.shutdown(true).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("router should exit")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_recovery_puts_host_back_under_monitoring() {
    let mut h = Harness::new(&["a"]).await;
    let (unit, host) = h.place_unit(true).await;
    let mut monitor = LivenessMonitor::new(
        h.pool.source.clone(),
        LivenessConfig {
            interval: Duration::from_secs(10),
            threshold: 1,
            probe_timeout: Duration::from_secs(1),
        },
    );

    h.pool.nodes.set(&host, Behavior::Dead);
    assert_eq!(monitor.probe_once().await.unwrap(), vec![host.clone()]);
    assert!(h.pool.urls().await.is_empty());

    let scheduled = h
        .router
        .handle_event(&NodeEvent::Down {
            url: host.clone(),
            hosted: Some(unit),
        })
        .await;
    assert_eq!(scheduled, vec![unit]);

    h.pool.nodes.set(&host, Behavior::Alive);
    let finished = h.router.wait_idle().await;
    assert_eq!(finished[0].1, Ok(RecoveryOutcome::Cancelled));
    assert_eq!(h.directory.health(unit).await, Some(UnitHealth::Alive));
    assert_eq!(h.directory.location(unit).await, Some(host.clone()));

    let nodes = h.pool.source.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].url, host);
    assert_eq!(nodes[0].hosted, Some(unit));

    // A second failure of the same host is noticed again
    h.pool.nodes.set(&host, Behavior::Dead);
    assert_eq!(monitor.probe_once().await.unwrap(), vec![host.clone()]);
    assert_eq!(h.restarter.count(), 0);
}

fn checkpoint_on(unit: UnitId, host: Option<ftpool_id::NodeUrl>) -> Checkpoint {
    Checkpoint::new(
        unit,
        SequenceNumber::FIRST,
        Incarnation::FIRST,
        StateSnapshot::new(1, b"{}".to_vec()),
        CheckpointInfo {
            host,
            ..CheckpointInfo::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn units_are_adopted_from_checkpoint_hosts() {
    let mut h = Harness::new(&["a", "b"]).await;
    let placed = UnitId::new();
    let hostless = UnitId::new();
    for (unit, host) in [(placed, Some(url("a"))), (hostless, None)] {
        h.store
            .store_checkpoint(checkpoint_on(unit, host), Incarnation::FIRST)
            .await
            .unwrap();
    }

    let adopted = adopt_checkpointed_units(h.store.as_ref(), h.directory.as_ref(), &h.pool.source)
        .await
        .unwrap();
    assert_eq!(adopted, 1);
    assert_eq!(h.directory.location(placed).await, Some(url("a")));
    assert_eq!(h.directory.location(hostless).await, None);
    let nodes = h.pool.source.nodes().await.unwrap();
    assert_eq!(nodes[0].url, url("a"));
    assert_eq!(nodes[0].hosted, Some(placed));

    // Known units are not adopted twice
    let again = adopt_checkpointed_units(h.store.as_ref(), h.directory.as_ref(), &h.pool.source)
        .await
        .unwrap();
    assert_eq!(again, 0);

    h.pool.nodes.set(&url("a"), Behavior::Dead);
    let scheduled = h
        .router
        .handle_event(&NodeEvent::Down {
            url: url("a"),
            hosted: Some(placed),
        })
        .await;
    assert_eq!(scheduled, vec![placed]);
    let finished = h.router.wait_idle().await;
    assert!(matches!(finished[0].1, Ok(RecoveryOutcome::Restarted { .. })));
    assert_eq!(h.directory.location(placed).await, Some(url("b")));
}

#[tokio::test(start_paused = true)]
async fn adopted_unit_on_unknown_host_is_still_located() {
    let h = Harness::new(&["a"]).await;
    let unit = UnitId::new();
    h.store
        .store_checkpoint(checkpoint_on(unit, Some(url("elsewhere"))), Incarnation::FIRST)
        .await
        .unwrap();

    let adopted = adopt_checkpointed_units(h.store.as_ref(), h.directory.as_ref(), &h.pool.source)
        .await
        .unwrap();
    assert_eq!(adopted, 1);
    assert_eq!(h.directory.location(unit).await, Some(url("elsewhere")));
    assert_eq!(h.pool.source.nodes().await.unwrap()[0].hosted, None);
}
