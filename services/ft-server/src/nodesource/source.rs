//! The node source actor and its handle.
//!
//! A node source owns a named pool of worker nodes. Every request against
//! the pool goes through the actor mailbox, so adds, removals and down
//! reports for the same pool never interleave. Resolving a new node's
//! runtime is the only slow step; it runs in a spawned task and comes back
//! as a `NodeResolved` message, leaving the record in `Adding` meanwhile.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ftpool_id::{DeploymentId, NodeUrl, UnitId};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::deployment::{AttachSink, Deployment};
use super::record::{
    NodeEvent, NodeRecord, NodeSourceStatus, NodeState, RemovalReason, RemovedNode,
};
use super::registry::Registry;
use super::remote::{lookup_within, NodeHandle, NodeLookup, RemoteError};
use crate::actors::{
    Actor, ActorContext, ActorError, ActorHandle, Flow, Supervisor, WeakActorHandle,
};

/// Name of the node source created when none is configured.
pub const DEFAULT_SOURCE_NAME: &str = "Default";

/// How many removed nodes are remembered.
pub const REMOVED_HISTORY_LIMIT: usize = 200;

// =============================================================================
// Configuration and errors
// =============================================================================

/// Node source settings.
#[derive(Debug, Clone)]
pub struct NodeSourceConfig {
    pub name: String,
    /// Bound on resolving a node URL.
    pub lookup_timeout: Duration,
    /// Bound on asking a node runtime to exit.
    pub kill_timeout: Duration,
    pub history_limit: usize,
    pub mailbox_size: usize,
    pub event_capacity: usize,
}

impl Default for NodeSourceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SOURCE_NAME.to_string(),
            lookup_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            history_limit: REMOVED_HISTORY_LIMIT,
            mailbox_size: 256,
            event_capacity: 256,
        }
    }
}

/// Errors returned to callers of node source operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeSourceError {
    #[error("node {0} is already in the node source")]
    DuplicateNode(NodeUrl),

    #[error("node source '{0}' is shutting down")]
    ShuttingDown(String),

    #[error("cannot resolve node: {0}")]
    Lookup(RemoteError),

    #[error("node {0} does not belong to this node source")]
    UnknownNode(NodeUrl),

    #[error("node source is no longer running")]
    Stopped,
}

// =============================================================================
// Messages
// =============================================================================

type Reply<T> = oneshot::Sender<T>;

/// Messages handled by [`NodeSourceActor`].
pub enum NodeSourceMessage {
    AddNode {
        url: NodeUrl,
        reply: Reply<Result<NodeRecord, NodeSourceError>>,
    },
    NodeResolved {
        url: NodeUrl,
        result: Result<Arc<dyn NodeHandle>, RemoteError>,
    },
    RemoveNode {
        url: NodeUrl,
        kill: bool,
        reply: Reply<Result<(), NodeSourceError>>,
    },
    AddNodes {
        deployment: Arc<dyn Deployment>,
        reply: Reply<Result<DeploymentId, NodeSourceError>>,
    },
    DeploymentFinished {
        id: DeploymentId,
        result: Result<(), String>,
    },
    Shutdown {
        preempt: bool,
        reply: Reply<()>,
    },
    DetectedDown {
        url: NodeUrl,
        reply: Reply<()>,
    },
    AcquireFree {
        unit: UnitId,
        reply: Reply<Result<Option<NodeRecord>, NodeSourceError>>,
    },
    Release {
        url: NodeUrl,
        reply: Reply<Result<(), NodeSourceError>>,
    },
    Assign {
        url: NodeUrl,
        unit: UnitId,
        reply: Reply<Result<NodeRecord, NodeSourceError>>,
    },
    Nodes {
        reply: Reply<Vec<NodeRecord>>,
    },
    ProbeTargets {
        reply: Reply<Vec<Arc<dyn NodeHandle>>>,
    },
    Removed {
        reply: Reply<Vec<RemovedNode>>,
    },
    Status {
        reply: Reply<NodeSourceStatus>,
    },
}

impl fmt::Debug for NodeSourceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddNode { url, .. } => f.debug_struct("AddNode").field("url", url).finish(),
            Self::NodeResolved { url, result } => f
                .debug_struct("NodeResolved")
                .field("url", url)
                .field("ok", &result.is_ok())
                .finish(),
            Self::RemoveNode { url, kill, .. } => f
                .debug_struct("RemoveNode")
                .field("url", url)
                .field("kill", kill)
                .finish(),
            Self::AddNodes { deployment, .. } => f
                .debug_struct("AddNodes")
                .field("deployment", &deployment.name())
                .finish(),
            Self::DeploymentFinished { id, result } => f
                .debug_struct("DeploymentFinished")
                .field("id", id)
                .field("result", result)
                .finish(),
            Self::Shutdown { preempt, .. } => {
                f.debug_struct("Shutdown").field("preempt", preempt).finish()
            }
            Self::DetectedDown { url, .. } => f.debug_struct("DetectedDown").field("url", url).finish(),
            Self::AcquireFree { unit, .. } => {
                f.debug_struct("AcquireFree").field("unit", unit).finish()
            }
            Self::Release { url, .. } => f.debug_struct("Release").field("url", url).finish(),
            Self::Assign { url, unit, .. } => f
                .debug_struct("Assign")
                .field("url", url)
                .field("unit", unit)
                .finish(),
            Self::Nodes { .. } => f.write_str("Nodes"),
            Self::ProbeTargets { .. } => f.write_str("ProbeTargets"),
            Self::Removed { .. } => f.write_str("Removed"),
            Self::Status { .. } => f.write_str("Status"),
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

struct Entry {
    record: NodeRecord,
    handle: Option<Arc<dyn NodeHandle>>,
}

/// Owns the records of one node source.
pub struct NodeSourceActor {
    config: NodeSourceConfig,
    registry: Arc<dyn Registry>,
    lookup: Arc<dyn NodeLookup>,
    entries: BTreeMap<NodeUrl, Entry>,
    pending_adds: HashMap<NodeUrl, Reply<Result<NodeRecord, NodeSourceError>>>,
    removed: VecDeque<RemovedNode>,
    deployments: HashMap<DeploymentId, String>,
    to_shutdown: bool,
    terminated: bool,
    events: broadcast::Sender<NodeEvent>,
    terminated_tx: watch::Sender<bool>,
    myself: WeakActorHandle<NodeSourceMessage>,
}

impl NodeSourceActor {
    fn new(
        config: NodeSourceConfig,
        registry: Arc<dyn Registry>,
        lookup: Arc<dyn NodeLookup>,
        events: broadcast::Sender<NodeEvent>,
        terminated_tx: watch::Sender<bool>,
        myself: WeakActorHandle<NodeSourceMessage>,
    ) -> Self {
        Self {
            config,
            registry,
            lookup,
            entries: BTreeMap::new(),
            pending_adds: HashMap::new(),
            removed: VecDeque::new(),
            deployments: HashMap::new(),
            to_shutdown: false,
            terminated: false,
            events,
            terminated_tx,
            myself,
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn shutting_down(&self) -> NodeSourceError {
        NodeSourceError::ShuttingDown(self.config.name.clone())
    }

    fn remember_removed(&mut self, record: &NodeRecord, reason: RemovalReason) {
        if self.removed.len() >= self.config.history_limit {
            self.removed.pop_front();
        }
        self.removed.push_back(RemovedNode {
            url: record.url.clone(),
            reason,
            hosted: record.hosted,
            removed_at: Utc::now(),
        });
    }

    fn was_removed(&self, url: &NodeUrl) -> bool {
        self.removed.iter().any(|r| &r.url == url)
    }

    // -------------------------------------------------------------------------
    // Adding
    // -------------------------------------------------------------------------

    fn handle_add_node(&mut self, url: NodeUrl, reply: Reply<Result<NodeRecord, NodeSourceError>>) {
        if self.to_shutdown {
            warn!(node_source = %self.name(), node_url = %url, "Add rejected, node source is shutting down");
            let _ = reply.send(Err(self.shutting_down()));
            return;
        }

        if self.entries.contains_key(&url) {
            warn!(node_source = %self.name(), node_url = %url, "Add rejected, duplicate node");
            let _ = reply.send(Err(NodeSourceError::DuplicateNode(url)));
            return;
        }

        debug!(node_source = %self.name(), node_url = %url, "Resolving node");
        self.entries.insert(
            url.clone(),
            Entry {
                record: NodeRecord::new(url.clone(), self.config.name.clone()),
                handle: None,
            },
        );
        self.pending_adds.insert(url.clone(), reply);

        let lookup = Arc::clone(&self.lookup);
        let limit = self.config.lookup_timeout;
        let myself = self.myself.clone();
        tokio::spawn(async move {
            let result = lookup_within(lookup.as_ref(), &url, limit).await;
            if let Some(handle) = myself.upgrade() {
                let _ = handle.send(NodeSourceMessage::NodeResolved { url, result }).await;
            }
        });
    }

    async fn handle_node_resolved(
        &mut self,
        url: NodeUrl,
        result: Result<Arc<dyn NodeHandle>, RemoteError>,
    ) {
        let reply = self.pending_adds.remove(&url);
        let answer = |outcome: Result<NodeRecord, NodeSourceError>| {
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        };

        let still_adding = self
            .entries
            .get(&url)
            .is_some_and(|e| e.record.state == NodeState::Adding);
        if !still_adding {
            debug!(node_source = %self.name(), node_url = %url, "Node left the pool while resolving");
            answer(Err(if self.to_shutdown {
                self.shutting_down()
            } else {
                NodeSourceError::UnknownNode(url)
            }));
            return;
        }

        if self.to_shutdown {
            self.entries.remove(&url);
            answer(Err(self.shutting_down()));
            self.maybe_terminate().await;
            return;
        }

        match result {
            Ok(handle) => {
                let Some(entry) = self.entries.get_mut(&url) else {
                    return;
                };
                entry.record.state = NodeState::Up;
                entry.handle = Some(handle);
                let record = entry.record.clone();

                info!(node_source = %self.config.name, node_url = %url, "Node added");
                self.registry
                    .register_available_node(&self.config.name, &url)
                    .await;
                self.emit(NodeEvent::Added { url });
                answer(Ok(record));
            }
            Err(e) => {
                warn!(node_source = %self.name(), node_url = %url, error = %e, "Node lookup failed");
                self.entries.remove(&url);
                answer(Err(NodeSourceError::Lookup(e)));
            }
        }
    }

    fn handle_add_nodes(
        &mut self,
        deployment: Arc<dyn Deployment>,
    ) -> Result<DeploymentId, NodeSourceError> {
        if self.to_shutdown {
            return Err(self.shutting_down());
        }
        let actor = self.myself.upgrade().ok_or(NodeSourceError::Stopped)?;

        let id = DeploymentId::new();
        let name = deployment.name().to_string();
        self.deployments.insert(id, name.clone());
        info!(node_source = %self.name(), deployment_id = %id, deployment = %name, "Starting deployment");

        let sink = AttachSink::new(
            NodeSourceHandle {
                actor,
                events: self.events.clone(),
                terminated: self.terminated_tx.subscribe(),
            },
            id,
        );
        let myself = self.myself.clone();
        tokio::spawn(async move {
            let result = deployment.deploy(sink).await.map_err(|e| e.to_string());
            if let Some(handle) = myself.upgrade() {
                let _ = handle
                    .send(NodeSourceMessage::DeploymentFinished { id, result })
                    .await;
            }
        });

        Ok(id)
    }

    fn handle_deployment_finished(&mut self, id: DeploymentId, result: Result<(), String>) {
        let name = self.deployments.remove(&id).unwrap_or_default();
        match result {
            Ok(()) => info!(deployment_id = %id, deployment = %name, "Deployment finished"),
            Err(e) => error!(deployment_id = %id, deployment = %name, error = %e, "Deployment failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Removal
    // -------------------------------------------------------------------------

    async fn kill(&self, handle: &Arc<dyn NodeHandle>) {
        match tokio::time::timeout(self.config.kill_timeout, handle.kill_runtime()).await {
            Ok(Ok(())) => debug!(node_url = %handle.url(), "Node runtime killed"),
            Ok(Err(e)) => warn!(node_url = %handle.url(), error = %e, "Cannot kill node runtime"),
            Err(_) => warn!(node_url = %handle.url(), "Killing node runtime timed out"),
        }
    }

    async fn handle_remove_node(&mut self, url: NodeUrl, kill: bool) -> Result<(), NodeSourceError> {
        let Some(entry) = self.entries.remove(&url) else {
            if self.was_removed(&url) {
                debug!(node_source = %self.name(), node_url = %url, "Node already removed");
                return Ok(());
            }
            error!(node_source = %self.name(), node_url = %url, "Removing node which does not belong to this node source");
            return Err(NodeSourceError::UnknownNode(url));
        };

        info!(node_source = %self.name(), node_url = %url, kill, "Removing node");
        if kill {
            if let Some(handle) = &entry.handle {
                self.kill(handle).await;
            }
        }

        let mut record = entry.record;
        record.state = NodeState::Removed;
        self.remember_removed(&record, RemovalReason::Requested);
        self.emit(NodeEvent::Removed {
            url,
            reason: RemovalReason::Requested,
        });

        self.maybe_terminate().await;
        Ok(())
    }

    async fn handle_detected_down(&mut self, url: NodeUrl) {
        let Some(entry) = self.entries.remove(&url) else {
            debug!(node_source = %self.name(), node_url = %url, "Down report for a node not in the pool, ignoring");
            return;
        };

        let mut record = entry.record;
        record.state = NodeState::Down;
        warn!(
            node_source = %self.config.name,
            node_url = %url,
            hosted = ?record.hosted,
            "Detected down node"
        );

        self.registry.set_down_node(&url).await;
        self.emit(NodeEvent::Down {
            url: url.clone(),
            hosted: record.hosted,
        });

        record.state = NodeState::Removed;
        self.remember_removed(&record, RemovalReason::Down);
        self.emit(NodeEvent::Removed {
            url,
            reason: RemovalReason::Down,
        });

        self.maybe_terminate().await;
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    async fn handle_shutdown(&mut self, preempt: bool) {
        if self.terminated {
            debug!(node_source = %self.name(), "Node source already terminated");
            return;
        }

        info!(node_source = %self.name(), preempt, nodes = self.entries.len(), "Node source shutting down");
        self.to_shutdown = true;

        if preempt {
            self.preempt_all().await;
        } else {
            let releasing: Vec<NodeUrl> = self
                .entries
                .iter_mut()
                .filter(|(_, e)| e.record.state == NodeState::Up)
                .map(|(url, e)| {
                    e.record.state = NodeState::ToBeReleased;
                    url.clone()
                })
                .collect();

            for url in releasing {
                self.registry
                    .node_removal_node_source_request(&url, false)
                    .await;
                self.emit(NodeEvent::ReleasePending { url });
            }
        }

        self.maybe_terminate().await;
    }

    async fn preempt_all(&mut self) {
        let entries = std::mem::take(&mut self.entries);

        for (url, reply) in self.pending_adds.drain() {
            debug!(node_url = %url, "Pending add cancelled by shutdown");
            let _ = reply.send(Err(NodeSourceError::ShuttingDown(self.config.name.clone())));
        }

        let mut kills = JoinSet::new();
        for entry in entries.values() {
            if let Some(handle) = &entry.handle {
                let handle = Arc::clone(handle);
                let limit = self.config.kill_timeout;
                kills.spawn(async move {
                    match tokio::time::timeout(limit, handle.kill_runtime()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(node_url = %handle.url(), error = %e, "Cannot kill node runtime")
                        }
                        Err(_) => warn!(node_url = %handle.url(), "Killing node runtime timed out"),
                    }
                });
            }
        }
        while kills.join_next().await.is_some() {}

        for (url, entry) in entries {
            self.registry
                .node_removal_node_source_request(&url, true)
                .await;
            let mut record = entry.record;
            record.state = NodeState::Removed;
            self.remember_removed(&record, RemovalReason::Preempted);
            self.emit(NodeEvent::Removed {
                url,
                reason: RemovalReason::Preempted,
            });
        }
    }

    async fn maybe_terminate(&mut self) {
        if !self.to_shutdown || self.terminated || !self.entries.is_empty() {
            return;
        }

        self.terminated = true;
        info!(node_source = %self.name(), "Node source terminated");
        self.registry.node_source_terminated(&self.config.name).await;
        self.terminated_tx.send_replace(true);
        self.emit(NodeEvent::Terminated);
    }

    // -------------------------------------------------------------------------
    // Allocation and queries
    // -------------------------------------------------------------------------

    fn handle_acquire_free(&mut self, unit: UnitId) -> Result<Option<NodeRecord>, NodeSourceError> {
        if self.to_shutdown {
            return Err(self.shutting_down());
        }

        let Some(entry) = self.entries.values_mut().find(|e| e.record.is_free()) else {
            debug!(node_source = %self.config.name, unit_id = %unit, "No free node");
            return Ok(None);
        };
        entry.record.hosted = Some(unit);
        debug!(node_url = %entry.record.url, unit_id = %unit, "Node allocated");
        Ok(Some(entry.record.clone()))
    }

    fn handle_release(&mut self, url: NodeUrl) -> Result<(), NodeSourceError> {
        if let Some(entry) = self.entries.get_mut(&url) {
            entry.record.hosted = None;
            debug!(node_url = %url, "Node released");
            return Ok(());
        }
        if self.was_removed(&url) {
            Ok(())
        } else {
            Err(NodeSourceError::UnknownNode(url))
        }
    }

    fn handle_assign(&mut self, url: NodeUrl, unit: UnitId) -> Result<NodeRecord, NodeSourceError> {
        let Some(entry) = self.entries.get_mut(&url) else {
            return Err(NodeSourceError::UnknownNode(url));
        };
        if let Some(other) = entry.record.hosted.filter(|hosted| *hosted != unit) {
            warn!(node_url = %url, unit_id = %unit, hosted = %other, "Node already hosts another unit, reassigning");
        }
        entry.record.hosted = Some(unit);
        debug!(node_url = %url, unit_id = %unit, "Node assigned");
        Ok(entry.record.clone())
    }

    fn status(&self) -> NodeSourceStatus {
        let count = |state| {
            self.entries
                .values()
                .filter(|e| e.record.state == state)
                .count()
        };
        NodeSourceStatus {
            name: self.config.name.clone(),
            adding: count(NodeState::Adding),
            up: count(NodeState::Up),
            to_be_released: count(NodeState::ToBeReleased),
            hosting: self
                .entries
                .values()
                .filter(|e| e.record.hosted.is_some())
                .count(),
            removed: self.removed.len(),
            deployments: self.deployments.keys().copied().collect(),
            shutting_down: self.to_shutdown,
            terminated: self.terminated,
        }
    }
}

#[async_trait]
impl Actor for NodeSourceActor {
    type Message = NodeSourceMessage;
    const KIND: &'static str = "node-source";

    async fn handle(
        &mut self,
        msg: NodeSourceMessage,
        _ctx: &mut ActorContext,
    ) -> Result<Flow, ActorError> {
        match msg {
            NodeSourceMessage::AddNode { url, reply } => self.handle_add_node(url, reply),
            NodeSourceMessage::NodeResolved { url, result } => {
                self.handle_node_resolved(url, result).await
            }
            NodeSourceMessage::RemoveNode { url, kill, reply } => {
                let _ = reply.send(self.handle_remove_node(url, kill).await);
            }
            NodeSourceMessage::AddNodes { deployment, reply } => {
                let _ = reply.send(self.handle_add_nodes(deployment));
            }
            NodeSourceMessage::DeploymentFinished { id, result } => {
                self.handle_deployment_finished(id, result)
            }
            NodeSourceMessage::Shutdown { preempt, reply } => {
                self.handle_shutdown(preempt).await;
                let _ = reply.send(());
            }
            NodeSourceMessage::DetectedDown { url, reply } => {
                self.handle_detected_down(url).await;
                let _ = reply.send(());
            }
            NodeSourceMessage::AcquireFree { unit, reply } => {
                let _ = reply.send(self.handle_acquire_free(unit));
            }
            NodeSourceMessage::Release { url, reply } => {
                let _ = reply.send(self.handle_release(url));
            }
            NodeSourceMessage::Assign { url, unit, reply } => {
                let _ = reply.send(self.handle_assign(url, unit));
            }
            NodeSourceMessage::Nodes { reply } => {
                let _ = reply.send(self.entries.values().map(|e| e.record.clone()).collect());
            }
            NodeSourceMessage::ProbeTargets { reply } => {
                let targets = self
                    .entries
                    .values()
                    .filter(|e| e.record.state.is_probed())
                    .filter_map(|e| e.handle.clone())
                    .collect();
                let _ = reply.send(targets);
            }
            NodeSourceMessage::Removed { reply } => {
                let _ = reply.send(self.removed.iter().cloned().collect());
            }
            NodeSourceMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        for (url, reply) in self.pending_adds.drain() {
            debug!(node_url = %url, "Pending add dropped on stop");
            let _ = reply.send(Err(NodeSourceError::Stopped));
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable async API of a running node source.
#[derive(Clone)]
pub struct NodeSourceHandle {
    actor: ActorHandle<NodeSourceMessage>,
    events: broadcast::Sender<NodeEvent>,
    terminated: watch::Receiver<bool>,
}

impl NodeSourceHandle {
    /// Spawns the node source actor under `supervisor`.
    pub fn spawn(
        supervisor: &mut Supervisor,
        config: NodeSourceConfig,
        registry: Arc<dyn Registry>,
        lookup: Arc<dyn NodeLookup>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (terminated_tx, terminated) = watch::channel(false);
        let mailbox_size = config.mailbox_size.max(1);

        let actor_events = events.clone();
        let actor = supervisor.spawn_with(
            move |myself| {
                NodeSourceActor::new(config, registry, lookup, actor_events, terminated_tx, myself)
            },
            mailbox_size,
        );

        Self {
            actor,
            events,
            terminated,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> NodeSourceMessage,
    ) -> Result<T, NodeSourceError> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .send(build(tx))
            .await
            .map_err(|_| NodeSourceError::Stopped)?;
        rx.await.map_err(|_| NodeSourceError::Stopped)
    }

    /// Adds a node; resolves once the node is `Up` or rejected.
    pub async fn add_node(&self, url: NodeUrl) -> Result<NodeRecord, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::AddNode { url, reply })
            .await?
    }

    /// Removes a node, optionally killing its runtime first.
    pub async fn remove_node(&self, url: NodeUrl, kill: bool) -> Result<(), NodeSourceError> {
        self.request(|reply| NodeSourceMessage::RemoveNode { url, kill, reply })
            .await?
    }

    /// Starts a deployment whose nodes attach to this source as they come up.
    pub async fn add_nodes(
        &self,
        deployment: Arc<dyn Deployment>,
    ) -> Result<DeploymentId, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::AddNodes { deployment, reply })
            .await?
    }

    /// Starts shutting down.
    ///
    /// A preemptive shutdown has completed when this returns. Otherwise
    /// completion is signalled through [`terminated`](Self::terminated) once
    /// every node has been removed.
    pub async fn shutdown(&self, preempt: bool) -> Result<(), NodeSourceError> {
        self.request(|reply| NodeSourceMessage::Shutdown { preempt, reply })
            .await
    }

    /// Reports a node that failed its liveness probes.
    ///
    /// Returns once the record has been dropped and the registry told.
    pub async fn detected_pinged_down_node(&self, url: NodeUrl) -> Result<(), NodeSourceError> {
        self.request(|reply| NodeSourceMessage::DetectedDown { url, reply })
            .await
    }

    /// Places `unit` on a free node, if any.
    pub async fn acquire_free_node(
        &self,
        unit: UnitId,
    ) -> Result<Option<NodeRecord>, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::AcquireFree { unit, reply })
            .await?
    }

    /// Records that `unit` runs on the pool node at `url`.
    pub async fn assign_node(&self, url: NodeUrl, unit: UnitId) -> Result<NodeRecord, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::Assign { url, unit, reply })
            .await?
    }

    /// Frees a node previously handed out by `acquire_free_node`.
    pub async fn release_node(&self, url: NodeUrl) -> Result<(), NodeSourceError> {
        self.request(|reply| NodeSourceMessage::Release { url, reply })
            .await?
    }

    pub async fn nodes(&self) -> Result<Vec<NodeRecord>, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::Nodes { reply }).await
    }

    pub async fn up_nodes(&self) -> Result<Vec<NodeRecord>, NodeSourceError> {
        Ok(self
            .nodes()
            .await?
            .into_iter()
            .filter(|n| n.state == NodeState::Up)
            .collect())
    }

    /// Handles of every node the liveness monitor should probe.
    pub async fn probe_targets(&self) -> Result<Vec<Arc<dyn NodeHandle>>, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::ProbeTargets { reply })
            .await
    }

    /// Recently removed nodes, oldest first.
    pub async fn removed_nodes(&self) -> Result<Vec<RemovedNode>, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::Removed { reply })
            .await
    }

    pub async fn status(&self) -> Result<NodeSourceStatus, NodeSourceError> {
        self.request(|reply| NodeSourceMessage::Status { reply })
            .await
    }

    /// Removes every node pending release that hosts nothing.
    ///
    /// This is the natural-drain step of a non-preemptive shutdown: nodes
    /// leave as their work completes. Returns how many nodes were removed.
    pub async fn drain_idle(&self) -> Result<usize, NodeSourceError> {
        let idle: Vec<NodeUrl> = self
            .nodes()
            .await?
            .into_iter()
            .filter(|n| n.state == NodeState::ToBeReleased && n.hosted.is_none())
            .map(|n| n.url)
            .collect();

        let mut removed = 0;
        for url in idle {
            match self.remove_node(url, false).await {
                Ok(()) => removed += 1,
                Err(NodeSourceError::UnknownNode(url)) => {
                    debug!(node_url = %url, "Node vanished before draining")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Flips to `true` once the node source has terminated.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Waits until the node source has terminated.
    pub async fn wait_terminated(&self) {
        let mut rx = self.terminated.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}
