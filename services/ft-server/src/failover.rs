//! Turns down-node events into recovery jobs.

use std::sync::Arc;

use ftpool_checkpoint::{CheckpointStore, StoreError};
use ftpool_id::UnitId;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::directory::{UnitDirectory, UnitHealth};
use crate::nodesource::{NodeEvent, NodeSourceHandle};
use crate::recovery::{RecoveryCoordinator, RecoveryError, RecoveryOutcome};

type Finished = (UnitId, Result<RecoveryOutcome, RecoveryError>);

/// Registers the checkpointed units the directory does not know yet.
///
/// A unit's location comes from the host recorded in its latest checkpoint.
/// Its node in `source`, if present, is marked as hosting it. Units already
/// in the directory are left alone: after a recovery their latest
/// checkpoint may still name the old host. Returns how many units were
/// adopted.
pub async fn adopt_checkpointed_units(
    store: &dyn CheckpointStore,
    directory: &dyn UnitDirectory,
    source: &NodeSourceHandle,
) -> Result<usize, StoreError> {
    let mut adopted = 0;
    for summary in store.units().await? {
        let unit = summary.unit_id;
        if directory.location(unit).await.is_some() {
            continue;
        }

        let checkpoint = match store.last_checkpoint(unit).await {
            Ok(checkpoint) => checkpoint,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        let Some(host) = checkpoint.info.host else {
            debug!(unit_id = %unit, "Checkpoint names no host, unit not adopted");
            continue;
        };

        directory.register(unit, host.clone()).await;
        if let Err(e) = source.assign_node(host.clone(), unit).await {
            warn!(unit_id = %unit, node_url = %host, error = %e, "Unit host is not in the pool");
        }
        adopted += 1;
    }
    if adopted > 0 {
        info!(adopted, "Adopted checkpointed units");
    }
    Ok(adopted)
}

/// Listens to a node source and recovers the units of every node that goes
/// down.
pub struct FailureRouter {
    recovery: Arc<RecoveryCoordinator>,
    directory: Arc<dyn UnitDirectory>,
    jobs: JoinSet<Finished>,
}

impl FailureRouter {
    pub fn new(recovery: Arc<RecoveryCoordinator>, directory: Arc<dyn UnitDirectory>) -> Self {
        Self {
            recovery,
            directory,
            jobs: JoinSet::new(),
        }
    }

    /// Number of recovery jobs still running.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Starts recovery for the units affected by `event`. Returns the units
    /// scheduled.
    pub async fn handle_event(&mut self, event: &NodeEvent) -> Vec<UnitId> {
        let NodeEvent::Down { url, hosted } = event else {
            return Vec::new();
        };

        let mut units = self.directory.units_on(url).await;
        if let Some(unit) = hosted {
            if !units.contains(unit) {
                units.push(*unit);
            }
        }
        if units.is_empty() {
            debug!(node_url = %url, "Down node hosted no unit");
            return units;
        }

        for unit in &units {
            let unit = *unit;
            if let Err(e) = self.directory.set_health(unit, UnitHealth::Down).await {
                debug!(unit_id = %unit, error = %e, "Unit not in directory");
            }
            info!(unit_id = %unit, node_url = %url, "Scheduling recovery");
            let recovery = Arc::clone(&self.recovery);
            self.jobs
                .spawn(async move { (unit, recovery.recover(unit).await) });
        }
        units
    }

    /// Waits for every running job and records its outcome.
    pub async fn wait_idle(&mut self) -> Vec<Finished> {
        let mut done = Vec::new();
        while let Some(joined) = self.jobs.join_next().await {
            if let Some(finished) = self.settle(joined).await {
                done.push(finished);
            }
        }
        done
    }

    async fn settle(&self, joined: Result<Finished, tokio::task::JoinError>) -> Option<Finished> {
        let (unit, result) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                error!(error = %e, "Recovery task failed");
                return None;
            }
        };

        match &result {
            Ok(RecoveryOutcome::Restarted { node, incarnation, .. }) => {
                info!(unit_id = %unit, node_url = %node, incarnation = %incarnation, "Recovery finished");
            }
            Ok(RecoveryOutcome::Cancelled) => {
                if let Err(e) = self.directory.set_health(unit, UnitHealth::Alive).await {
                    debug!(unit_id = %unit, error = %e, "Unit not in directory");
                }
            }
            Err(e) => self.directory.mark_failed(unit, e.to_string()).await,
        }
        Some((unit, result))
    }

    /// Routes events until `shutdown` flips, the event channel closes or the
    /// node source terminates. Running jobs are aborted on exit.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<NodeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting failure router");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(NodeEvent::Terminated) => {
                        info!("Node source terminated, failure router exiting");
                        break;
                    }
                    Ok(event) => {
                        self.handle_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Failure router fell behind on node events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    self.settle(joined).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Failure router shutting down");
                        break;
                    }
                }
            }
        }

        if !self.jobs.is_empty() {
            warn!(pending = self.jobs.len(), "Aborting running recoveries");
            self.jobs.shutdown().await;
        }
    }
}
