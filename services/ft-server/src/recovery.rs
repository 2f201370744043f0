//! Restarting failed units from their latest checkpoint.
//!
//! A recovery job runs in this order:
//!
//! 1. Fetch the latest checkpoint. Without one the unit cannot come back,
//!    so the job fails before any node is touched.
//! 2. Acquire a free node, retrying with backoff until the recovery timeout.
//!    Each retry first checks whether the unit's old host answers again; if
//!    it does, the job is cancelled.
//! 3. Check liveness once more, fence the store to the next incarnation,
//!    restart the unit on the node and record its new location.
//!
//! Jobs are single-flight per unit: concurrent `recover` calls for the same
//! unit share one job and its outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ftpool_checkpoint::{CheckpointStore, StoreError};
use ftpool_id::{Incarnation, NodeUrl, RecoveryJobId, SequenceNumber, UnitId};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::directory::{UnitDirectory, UnitHealth};
use crate::ft::RestartPackage;
use crate::launch::{CommandDescriptor, CommandRunner, LaunchPipeline, RemoteLogin};
use crate::nodesource::{NodeRecord, NodeSourceError, NodeSourceHandle};

// =============================================================================
// Collaborators
// =============================================================================

/// Hands out free nodes for restarted units.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Reserves a free node for `unit`, or `None` if there is none.
    async fn acquire(&self, unit: UnitId) -> Result<Option<NodeRecord>, NodeSourceError>;

    /// Returns a node reserved by `acquire`.
    async fn release(&self, url: &NodeUrl);

    /// Takes a host that answers again back into the pool, hosting `unit`.
    async fn readmit(&self, unit: UnitId, url: &NodeUrl) -> Result<(), NodeSourceError>;
}

#[async_trait]
impl NodeProvider for NodeSourceHandle {
    async fn acquire(&self, unit: UnitId) -> Result<Option<NodeRecord>, NodeSourceError> {
        self.acquire_free_node(unit).await
    }

    async fn release(&self, url: &NodeUrl) {
        if let Err(e) = self.release_node(url.clone()).await {
            warn!(node_url = %url, error = %e, "Cannot release node");
        }
    }

    async fn readmit(&self, unit: UnitId, url: &NodeUrl) -> Result<(), NodeSourceError> {
        match self.add_node(url.clone()).await {
            Ok(_) | Err(NodeSourceError::DuplicateNode(_)) => {}
            Err(e) => return Err(e),
        }
        self.assign_node(url.clone(), unit).await.map(|_| ())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RestartError {
    #[error("restart command failed: {0}")]
    Launch(String),

    #[error("unit refused to restart: {0}")]
    Refused(String),
}

/// Deserializes a checkpoint onto a node and resumes the unit there.
#[async_trait]
pub trait UnitRestarter: Send + Sync {
    async fn restart(&self, node: &NodeRecord, package: &RestartPackage) -> Result<(), RestartError>;
}

/// Restarts units by running a command on the target node over `ssh`.
///
/// The command gets the unit, checkpoint sequence and incarnation as
/// arguments and is expected to load the checkpoint from the shared store.
pub struct CommandRestarter {
    program: String,
    user: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandRestarter {
    pub fn new(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            user: None,
            runner,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn command(&self, node: &NodeRecord, package: &RestartPackage) -> Result<CommandDescriptor, RestartError> {
        let mut login = RemoteLogin::new(node.url.host());
        if let Some(user) = &self.user {
            login = login.user(user);
        }
        LaunchPipeline::new()
            .stage(login)
            .apply(
                CommandDescriptor::new(&self.program)
                    .arg("restart")
                    .arg("--unit")
                    .arg(package.unit().to_string())
                    .arg("--checkpoint-seq")
                    .arg(package.checkpoint.seq.to_string())
                    .arg("--incarnation")
                    .arg(package.incarnation.to_string())
                    .arg("--node")
                    .arg(node.url.as_str()),
            )
            .map_err(|e| RestartError::Launch(e.to_string()))
    }
}

#[async_trait]
impl UnitRestarter for CommandRestarter {
    async fn restart(&self, node: &NodeRecord, package: &RestartPackage) -> Result<(), RestartError> {
        let command = self.command(node, package)?;
        self.runner
            .run(&command)
            .await
            .map(|_| ())
            .map_err(|e| RestartError::Launch(e.to_string()))
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How long a job waits for a free node.
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(60_000),
            backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(10),
                jitter: 0.25,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Restarted {
        node: NodeUrl,
        incarnation: Incarnation,
        seq: SequenceNumber,
    },
    /// The unit's host came back before the restart was committed.
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("unit {0} has no checkpoint and cannot be recovered")]
    NoCheckpoint(UnitId),

    #[error("no free node for unit {unit} after {waited:?}")]
    NoFreeNode { unit: UnitId, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("restart of unit {unit} failed: {reason}")]
    RestartFailed { unit: UnitId, reason: String },

    /// The job running this recovery went away before finishing.
    #[error("recovery of unit {0} was interrupted")]
    Interrupted(UnitId),
}

type JobResult = Result<RecoveryOutcome, RecoveryError>;
type Inflight = Mutex<HashMap<UnitId, watch::Receiver<Option<JobResult>>>>;

/// Removes a unit's in-flight entry when its job ends, however it ends.
struct InflightGuard<'a> {
    inflight: &'a Inflight,
    unit: UnitId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        lock(self.inflight).remove(&self.unit);
    }
}

fn lock(inflight: &Inflight) -> MutexGuard<'_, HashMap<UnitId, watch::Receiver<Option<JobResult>>>> {
    inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs recovery jobs.
pub struct RecoveryCoordinator {
    store: Arc<dyn CheckpointStore>,
    nodes: Arc<dyn NodeProvider>,
    restarter: Arc<dyn UnitRestarter>,
    directory: Arc<dyn UnitDirectory>,
    config: RecoveryConfig,
    inflight: Inflight,
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        nodes: Arc<dyn NodeProvider>,
        restarter: Arc<dyn UnitRestarter>,
        directory: Arc<dyn UnitDirectory>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            nodes,
            restarter,
            directory,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Units with a job in progress.
    pub fn in_progress(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = lock(&self.inflight).keys().copied().collect();
        units.sort();
        units
    }

    /// Recovers `unit`, or joins the job already recovering it.
    pub async fn recover(&self, unit: UnitId) -> JobResult {
        let leader = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&unit) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(unit, rx);
                    Ok(tx)
                }
            }
        };

        let tx = match leader {
            Ok(tx) => tx,
            Err(mut rx) => {
                debug!(unit_id = %unit, "Joining recovery in progress");
                return match rx.wait_for(Option::is_some).await {
                    Ok(done) => (*done).clone().unwrap_or(Err(RecoveryError::Interrupted(unit))),
                    Err(_) => Err(RecoveryError::Interrupted(unit)),
                };
            }
        };

        let guard = InflightGuard {
            inflight: &self.inflight,
            unit,
        };
        let result = self.run(unit).await;
        drop(guard);
        tx.send_replace(Some(result.clone()));
        result
    }

    async fn run(&self, unit: UnitId) -> JobResult {
        let job = RecoveryJobId::new();
        info!(job_id = %job, unit_id = %unit, "Recovery started");

        let checkpoint = match self.store.last_checkpoint(unit).await {
            Ok(checkpoint) => checkpoint,
            Err(e) if e.is_not_found() => {
                error!(job_id = %job, unit_id = %unit, "No checkpoint, unit cannot be recovered");
                return Err(RecoveryError::NoCheckpoint(unit));
            }
            Err(e) => return Err(e.into()),
        };
        let log = if self.store.capabilities().message_log {
            self.store.message_log(unit).await?
        } else {
            Vec::new()
        };
        let previous = self.store.incarnation(unit).await?.max(checkpoint.incarnation);
        if let Err(e) = self.directory.set_health(unit, UnitHealth::Recovering).await {
            debug!(job_id = %job, unit_id = %unit, error = %e, "Unit not in directory");
        }

        let Some(node) = self.acquire_node(job, unit).await? else {
            self.readmit_host(job, unit).await;
            return Ok(RecoveryOutcome::Cancelled);
        };

        if self.directory.is_reachable(unit).await {
            info!(job_id = %job, unit_id = %unit, "Unit host is back, recovery cancelled");
            self.nodes.release(&node.url).await;
            self.readmit_host(job, unit).await;
            return Ok(RecoveryOutcome::Cancelled);
        }

        let package = RestartPackage::new(checkpoint, log, previous);
        if let Err(e) = self.store.fence(unit, package.incarnation).await {
            self.nodes.release(&node.url).await;
            return Err(e.into());
        }

        if let Err(e) = self.restarter.restart(&node, &package).await {
            error!(job_id = %job, unit_id = %unit, node_url = %node.url, error = %e, "Restart failed");
            self.nodes.release(&node.url).await;
            return Err(RecoveryError::RestartFailed {
                unit,
                reason: e.to_string(),
            });
        }

        self.directory.register(unit, node.url.clone()).await;
        info!(
            job_id = %job,
            unit_id = %unit,
            node_url = %node.url,
            seq = %package.checkpoint.seq,
            incarnation = %package.incarnation,
            "Unit recovered"
        );

        Ok(RecoveryOutcome::Restarted {
            node: node.url,
            incarnation: package.incarnation,
            seq: package.checkpoint.seq,
        })
    }

    /// Puts the unit's old host back under liveness monitoring.
    async fn readmit_host(&self, job: RecoveryJobId, unit: UnitId) {
        let Some(url) = self.directory.location(unit).await else {
            return;
        };
        match self.nodes.readmit(unit, &url).await {
            Ok(()) => info!(job_id = %job, unit_id = %unit, node_url = %url, "Host readmitted to the pool"),
            Err(e) => warn!(job_id = %job, unit_id = %unit, node_url = %url, error = %e, "Cannot readmit host"),
        }
    }

    /// Waits for a free node. `None` means the job was cancelled.
    async fn acquire_node(&self, job: RecoveryJobId, unit: UnitId) -> Result<Option<NodeRecord>, RecoveryError> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut attempt = 0u32;

        loop {
            if self.directory.is_reachable(unit).await {
                info!(job_id = %job, unit_id = %unit, "Unit host is back, recovery cancelled");
                return Ok(None);
            }

            match self.nodes.acquire(unit).await {
                Ok(Some(node)) => {
                    debug!(job_id = %job, unit_id = %unit, node_url = %node.url, "Node acquired");
                    return Ok(Some(node));
                }
                Ok(None) => {}
                Err(e) => warn!(job_id = %job, unit_id = %unit, error = %e, "Node source cannot allocate"),
            }

            let now = Instant::now();
            if now >= deadline {
                error!(job_id = %job, unit_id = %unit, "No free node before timeout");
                return Err(RecoveryError::NoFreeNode {
                    unit,
                    waited: now - started,
                });
            }

            let delay = self.config.backoff.delay(attempt).min(deadline - now);
            attempt = attempt.saturating_add(1);
            debug!(job_id = %job, unit_id = %unit, attempt, retry_in_ms = delay.as_millis() as u64, "Waiting for a free node");
            tokio::time::sleep(delay).await;
        }
    }
}
