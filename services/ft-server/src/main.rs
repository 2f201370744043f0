//! ftpool fault-tolerance server
//!
//! Runs one node source with its liveness monitor, and recovers the units
//! of nodes that go down from the checkpoint store.
//!
//! ## Architecture
//!
//! - **Node source**: Actor owning the node pool, fed by static nodes
//! - **Liveness monitor**: Probes nodes and reports the down ones
//! - **Failure router**: Turns down reports into recovery jobs
//! - **Unit adoption**: Locates units from the hosts their checkpoints name
//! - **Recovery coordinator**: Restarts units from their latest checkpoint

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ftpool_checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore, TimeoutStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ftpool_server::actors::Supervisor;
use ftpool_server::config::{Config, StoreLocation};
use ftpool_server::launch::TokioCommandRunner;
use ftpool_server::nodesource::{InMemoryRegistry, TcpNodeLookup};
use ftpool_server::recovery::CommandRestarter;
use ftpool_server::{
    adopt_checkpointed_units, FailureRouter, InMemoryDirectory, LivenessMonitor, NodeSourceHandle,
    RecoveryCoordinator, UnitDirectory,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        store = ?config.store,
        retention = %config.retention,
        protocol = %config.protocol,
        node_source = %config.node_source,
        "Starting ftpool fault-tolerance server"
    );

    let store = open_store(&config)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut supervisor = Supervisor::new();
    let registry = Arc::new(InMemoryRegistry::new());
    let lookup = Arc::new(TcpNodeLookup::new(config.node_lookup_timeout));
    let source = NodeSourceHandle::spawn(
        &mut supervisor,
        config.node_source_config(),
        registry,
        lookup.clone(),
    );

    for url in &config.static_nodes {
        match source.add_node(url.clone()).await {
            Ok(_) => info!(node_url = %url, "Static node registered"),
            Err(e) => warn!(node_url = %url, error = %e, "Static node not registered"),
        }
    }

    let directory = Arc::new(InMemoryDirectory::new(lookup, config.probe_timeout));
    if let Err(e) = adopt_checkpointed_units(store.as_ref(), directory.as_ref(), &source).await {
        warn!(error = %e, "Cannot read units from the checkpoint store");
    }

    let runner = Arc::new(TokioCommandRunner::default());
    let restarter = Arc::new(CommandRestarter::new(&config.restart_command, runner));
    let recovery = Arc::new(RecoveryCoordinator::new(
        Arc::clone(&store),
        Arc::new(source.clone()),
        restarter,
        directory.clone(),
        config.recovery_config(),
    ));

    // Keep picking up units that start checkpointing after boot
    let adoption_handle = tokio::spawn(adopt_periodically(
        Arc::clone(&store),
        directory.clone(),
        source.clone(),
        config.liveness_config().interval,
        shutdown_rx.clone(),
    ));

    // Start the failure router
    let router = FailureRouter::new(recovery, directory);
    let router_handle = tokio::spawn({
        let events = source.subscribe();
        let shutdown_rx = shutdown_rx.clone();
        async move { router.run(events, shutdown_rx).await }
    });

    // Start the liveness monitor
    let monitor = LivenessMonitor::new(source.clone(), config.liveness_config());
    let monitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { monitor.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = source.wait_terminated() => {
            warn!("Node source terminated");
        }
    }

    shutdown_node_source(&source, config.shutdown_grace).await;

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    for (name, handle) in [
        ("failure router", router_handle),
        ("liveness monitor", monitor_handle),
        ("unit adoption", adoption_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task panicked");
        }
    }
    supervisor.stop_all().await;

    info!("Fault-tolerance server shutdown complete");
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match &config.store {
        StoreLocation::Memory => {
            warn!("In-memory checkpoint store: units outside this process cannot checkpoint, so none will be recovered");
            Arc::new(InMemoryCheckpointStore::new(config.retention))
        }
        StoreLocation::Sqlite(path) => {
            info!(path = %path.display(), "Opening SQLite checkpoint store");
            Arc::new(SqliteCheckpointStore::open(path, config.retention)?)
        }
    };
    Ok(Arc::new(TimeoutStore::new(store, config.checkpoint_timeout)))
}

async fn adopt_periodically(
    store: Arc<dyn CheckpointStore>,
    directory: Arc<dyn UnitDirectory>,
    source: NodeSourceHandle,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                if let Err(e) = adopt_checkpointed_units(store.as_ref(), directory.as_ref(), &source).await {
                    warn!(error = %e, "Unit adoption failed");
                }
            }
        }
    }
}

/// Drains the node source gracefully, then preempts whatever is left once
/// `grace` has passed.
async fn shutdown_node_source(source: &NodeSourceHandle, grace: Duration) {
    if source.is_terminated() {
        return;
    }

    if let Err(e) = source.shutdown(false).await {
        error!(error = %e, "Graceful node source shutdown failed");
        return;
    }

    let drained = tokio::time::timeout(grace, async {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        while !source.is_terminated() {
            tick.tick().await;
            if let Err(e) = source.drain_idle().await {
                warn!(error = %e, "Draining idle nodes failed");
                return;
            }
        }
    })
    .await;

    if drained.is_err() || !source.is_terminated() {
        warn!(grace_ms = grace.as_millis() as u64, "Nodes did not drain in time, preempting");
        if let Err(e) = source.shutdown(true).await {
            error!(error = %e, "Preemptive node source shutdown failed");
        }
    }
}
