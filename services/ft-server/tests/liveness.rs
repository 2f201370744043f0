mod common;

use std::time::Duration;

use common::{url, Behavior, Pool};
use ftpool_server::liveness::{LivenessConfig, LivenessMonitor};
use ftpool_server::nodesource::NodeEvent;
use tokio::sync::watch;

fn config(threshold: u32) -> LivenessConfig {
    LivenessConfig {
        interval: Duration::from_secs(10),
        threshold,
        probe_timeout: Duration::from_secs(2),
    }
}

#[tokio::test(start_paused = true)]
async fn dead_node_reported_down() {
    let pool = Pool::with_nodes(&["a", "b"]).await;
    pool.nodes.set(&url("a"), Behavior::Dead);
    let mut monitor = LivenessMonitor::new(pool.source.clone(), config(1));

    let down = monitor.probe_once().await.unwrap();

    assert_eq!(down, vec![url("a")]);
    assert_eq!(pool.urls().await, vec![url("b")]);
    assert_eq!(pool.registry.down_reports(&url("a")), 1);
}

#[tokio::test(start_paused = true)]
async fn threshold_counts_consecutive_failures() {
    let pool = Pool::with_nodes(&["a"]).await;
    pool.nodes.set(&url("a"), Behavior::Dead);
    let mut monitor = LivenessMonitor::new(pool.source.clone(), config(3));

    assert!(monitor.probe_once().await.unwrap().is_empty());
    assert!(monitor.probe_once().await.unwrap().is_empty());
    assert_eq!(monitor.failures(&url("a")), 2);

    // One good answer resets the count
    pool.nodes.set(&url("a"), Behavior::Alive);
    assert!(monitor.probe_once().await.unwrap().is_empty());
    assert_eq!(monitor.failures(&url("a")), 0);

    pool.nodes.set(&url("a"), Behavior::Dead);
    for _ in 0..2 {
        assert!(monitor.probe_once().await.unwrap().is_empty());
    }
    assert_eq!(monitor.probe_once().await.unwrap(), vec![url("a")]);
    assert_eq!(pool.registry.down_reports(&url("a")), 1);
    assert_eq!(monitor.failures(&url("a")), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_threshold_acts_as_one() {
    let pool = Pool::with_nodes(&["a"]).await;
    pool.nodes.set(&url("a"), Behavior::Dead);
    let mut monitor = LivenessMonitor::new(pool.source.clone(), config(0));

    assert_eq!(monitor.probe_once().await.unwrap(), vec![url("a")]);
}

#[tokio::test(start_paused = true)]
async fn hanging_probe_does_not_hold_up_others() {
    let pool = Pool::with_nodes(&["a", "b", "c"]).await;
    pool.nodes.set(&url("a"), Behavior::Hanging);
    pool.nodes.set(&url("c"), Behavior::Dead);
    let mut monitor = LivenessMonitor::new(pool.source.clone(), config(1));

    let started = tokio::time::Instant::now();
    let down = monitor.probe_once().await.unwrap();

    assert_eq!(down, vec![url("a"), url("c")]);
    // The round lasts one probe timeout, not one per node
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(pool.urls().await, vec![url("b")]);
}

#[tokio::test(start_paused = true)]
async fn counters_of_removed_nodes_are_forgotten() {
    let pool = Pool::with_nodes(&["a"]).await;
    pool.nodes.set(&url("a"), Behavior::Dead);
    let mut monitor = LivenessMonitor::new(pool.source.clone(), config(5));

    monitor.probe_once().await.unwrap();
    assert_eq!(monitor.failures(&url("a")), 1);

    pool.source.remove_node(url("a"), false).await.unwrap();
    monitor.probe_once().await.unwrap();
    assert_eq!(monitor.failures(&url("a")), 0);
}

#[tokio::test(start_paused = true)]
async fn run_probes_every_interval() {
    let pool = Pool::with_nodes(&["a", "b"]).await;
    let mut events = pool.source.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = LivenessMonitor::new(pool.source.clone(), config(2));
    let task = tokio::spawn(monitor.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(pool.nodes.pings(&url("a")) >= 3);

    pool.nodes.set(&url("b"), Behavior::Dead);
    loop {
        if let NodeEvent::Down { url: down, .. } = events.recv().await.unwrap() {
            assert_eq!(down, url("b"));
            break;
        }
    }
    assert_eq!(pool.urls().await, vec![url("a")]);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn run_exits_when_source_terminates() {
    let pool = Pool::with_nodes(&["a"]).await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = LivenessMonitor::new(pool.source.clone(), config(1));
    let task = tokio::spawn(monitor.run(shutdown_rx));

    pool.source.shutdown(true).await.unwrap();
    tokio::time::timeout(Duration::from_secs(60), task)
        .await
        .expect("monitor should exit")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn down_report_applied_before_probe_returns() {
    let pool = Pool::with_nodes(&["a", "b"]).await;
    pool.nodes.set(&url("b"), Behavior::Dead);
    let mut monitor = LivenessMonitor::new(pool.source.clone(), config(1));

    assert_eq!(monitor.probe_once().await.unwrap(), vec![url("b")]);
    // No round trip through the source before checking the registry
    assert_eq!(pool.registry.down_reports(&url("b")), 1);
}
