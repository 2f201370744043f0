//! Fakes shared by the integration suites.
//!
//! Nodes, transports, unit state and restarts are all in-process so every
//! test can run on a paused tokio clock.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ftpool_checkpoint::{
    Checkpoint, CheckpointStore, InMemoryCheckpointStore, MessageLogEntry, Reply, Request,
    RetentionPolicy, StateSnapshot, StoreResult, UnitSummary,
};
use ftpool_id::{GlobalStateIndex, Incarnation, NodeUrl, SequenceNumber, UnitId};
use ftpool_server::actors::Supervisor;
use ftpool_server::ft::{CaptureError, RestartPackage, StateCapture, Transport, TransportError};
use ftpool_server::nodesource::{
    InMemoryRegistry, NodeHandle, NodeLookup, NodeRecord, NodeSourceConfig, NodeSourceHandle,
    RemoteError,
};
use ftpool_server::recovery::{RestartError, UnitRestarter};

pub fn url(name: &str) -> NodeUrl {
    NodeUrl::parse(&format!("tcp://{name}:1099/{name}")).unwrap()
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Alive,
    /// Refuses connections.
    Dead,
    /// Never answers.
    Hanging,
}

#[derive(Debug, Default)]
struct Cluster {
    behavior: HashMap<NodeUrl, Behavior>,
    kills: Vec<NodeUrl>,
    pings: HashMap<NodeUrl, usize>,
}

/// A cluster of fake node runtimes. Unknown URLs are dead.
#[derive(Debug, Clone, Default)]
pub struct FakeNodes {
    cluster: Arc<Mutex<Cluster>>,
}

impl FakeNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &NodeUrl, behavior: Behavior) -> Self {
        self.set(url, behavior);
        self
    }

    pub fn set(&self, url: &NodeUrl, behavior: Behavior) {
        self.cluster
            .lock()
            .unwrap()
            .behavior
            .insert(url.clone(), behavior);
    }

    pub fn kills(&self) -> Vec<NodeUrl> {
        self.cluster.lock().unwrap().kills.clone()
    }

    pub fn pings(&self, url: &NodeUrl) -> usize {
        self.cluster
            .lock()
            .unwrap()
            .pings
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    fn behavior(&self, url: &NodeUrl) -> Behavior {
        self.cluster
            .lock()
            .unwrap()
            .behavior
            .get(url)
            .copied()
            .unwrap_or(Behavior::Dead)
    }

    async fn answer(&self, url: &NodeUrl) -> Result<(), RemoteError> {
        match self.behavior(url) {
            Behavior::Alive => Ok(()),
            Behavior::Dead => Err(RemoteError::Unreachable {
                url: url.clone(),
                reason: "connection refused".to_string(),
            }),
            Behavior::Hanging => std::future::pending().await,
        }
    }
}

#[derive(Debug)]
struct FakeNode {
    url: NodeUrl,
    nodes: FakeNodes,
}

#[async_trait]
impl NodeHandle for FakeNode {
    fn url(&self) -> &NodeUrl {
        &self.url
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        *self
            .nodes
            .cluster
            .lock()
            .unwrap()
            .pings
            .entry(self.url.clone())
            .or_insert(0) += 1;
        self.nodes.answer(&self.url).await
    }

    async fn kill_runtime(&self) -> Result<(), RemoteError> {
        self.nodes.cluster.lock().unwrap().kills.push(self.url.clone());
        self.nodes.answer(&self.url).await
    }
}

#[async_trait]
impl NodeLookup for FakeNodes {
    async fn lookup(&self, url: &NodeUrl) -> Result<Arc<dyn NodeHandle>, RemoteError> {
        self.answer(url).await?;
        Ok(Arc::new(FakeNode {
            url: url.clone(),
            nodes: self.clone(),
        }))
    }
}

/// A running node source over fake nodes.
///
/// Holds the supervisor: dropping it stops the actor.
pub struct Pool {
    pub supervisor: Supervisor,
    pub source: NodeSourceHandle,
    pub registry: Arc<InMemoryRegistry>,
    pub nodes: FakeNodes,
}

impl Pool {
    pub fn start(nodes: FakeNodes) -> Self {
        Self::start_named("pool", nodes)
    }

    pub fn start_named(name: &str, nodes: FakeNodes) -> Self {
        let mut supervisor = Supervisor::new();
        let registry = Arc::new(InMemoryRegistry::new());
        let config = NodeSourceConfig {
            name: name.to_string(),
            lookup_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(1),
            ..NodeSourceConfig::default()
        };
        let source = NodeSourceHandle::spawn(
            &mut supervisor,
            config,
            registry.clone(),
            Arc::new(nodes.clone()),
        );
        Self {
            supervisor,
            source,
            registry,
            nodes,
        }
    }

    /// Starts a pool whose listed nodes are alive and already added.
    pub async fn with_nodes(names: &[&str]) -> Self {
        let nodes = FakeNodes::new();
        for name in names {
            nodes.set(&url(name), Behavior::Alive);
        }
        let pool = Self::start(nodes);
        for name in names {
            pool.source.add_node(url(name)).await.unwrap();
        }
        pool
    }

    pub async fn urls(&self) -> Vec<NodeUrl> {
        self.source
            .nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.url)
            .collect()
    }
}

// =============================================================================
// Units
// =============================================================================

/// Unit state: one counter, snapshotted as JSON.
#[derive(Debug, Default)]
pub struct Counter {
    x: Mutex<i64>,
    snapshots: AtomicUsize,
}

impl Counter {
    pub const VERSION: u32 = 1;

    pub fn new(x: i64) -> Arc<Self> {
        Arc::new(Self {
            x: Mutex::new(x),
            snapshots: AtomicUsize::new(0),
        })
    }

    pub fn get(&self) -> i64 {
        *self.x.lock().unwrap()
    }

    pub fn set(&self, x: i64) {
        *self.x.lock().unwrap() = x;
    }

    pub fn snapshots(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateCapture for Counter {
    async fn snapshot(&self) -> Result<StateSnapshot, CaptureError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        let bytes = serde_json::to_vec(&serde_json::json!({ "x": self.get() }))
            .map_err(|e| CaptureError::Snapshot(e.to_string()))?;
        Ok(StateSnapshot::new(Self::VERSION, bytes))
    }

    async fn restore(&self, snapshot: &StateSnapshot) -> Result<(), CaptureError> {
        if snapshot.version != Self::VERSION {
            return Err(CaptureError::UnsupportedVersion {
                found: snapshot.version,
                expected: Self::VERSION,
            });
        }
        let value: serde_json::Value = serde_json::from_slice(&snapshot.bytes)
            .map_err(|e| CaptureError::Restore(e.to_string()))?;
        let x = value["x"]
            .as_i64()
            .ok_or_else(|| CaptureError::Restore("missing x".to_string()))?;
        self.set(x);
        Ok(())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Delivers everything except to units marked unreachable or rejecting.
#[derive(Debug, Default)]
pub struct FakeTransport {
    unreachable: Mutex<HashSet<UnitId>>,
    rejecting: Mutex<HashSet<UnitId>>,
    /// Remaining failures before a target becomes reachable.
    flaky: Mutex<HashMap<UnitId, usize>>,
    attempts: AtomicUsize,
    pub requests: Mutex<Vec<Request>>,
    pub replies: Mutex<Vec<Reply>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable(&self, unit: UnitId) {
        self.unreachable.lock().unwrap().insert(unit);
    }

    pub fn rejecting(&self, unit: UnitId) {
        self.rejecting.lock().unwrap().insert(unit);
    }

    pub fn flaky(&self, unit: UnitId, failures: usize) {
        self.flaky.lock().unwrap().insert(unit, failures);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self, target: UnitId) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.lock().unwrap().contains(&target) {
            return Err(TransportError::Rejected {
                target,
                reason: "no such method".to_string(),
            });
        }
        if self.unreachable.lock().unwrap().contains(&target) {
            return Err(TransportError::Unreachable {
                target,
                reason: "connection refused".to_string(),
            });
        }
        let mut flaky = self.flaky.lock().unwrap();
        if let Some(left) = flaky.get_mut(&target) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Unreachable {
                    target,
                    reason: "connection reset".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn deliver_request(&self, request: &Request) -> Result<(), TransportError> {
        self.check(request.target)?;
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn deliver_reply(&self, reply: &Reply) -> Result<(), TransportError> {
        self.check(reply.target)?;
        self.replies.lock().unwrap().push(reply.clone());
        Ok(())
    }
}

// =============================================================================
// Restarts
// =============================================================================

/// Records restarts; optionally slow or failing.
#[derive(Debug, Default)]
pub struct FakeRestarter {
    delay: Option<Duration>,
    fail: bool,
    pub restarts: Mutex<Vec<(NodeUrl, RestartPackage)>>,
}

impl FakeRestarter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn count(&self) -> usize {
        self.restarts.lock().unwrap().len()
    }
}

#[async_trait]
impl UnitRestarter for FakeRestarter {
    async fn restart(&self, node: &NodeRecord, package: &RestartPackage) -> Result<(), RestartError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(RestartError::Refused("unit class not found".to_string()));
        }
        self.restarts
            .lock()
            .unwrap()
            .push((node.url.clone(), package.clone()));
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// In-memory store whose checkpoint writes take `delay`.
pub struct SlowStore {
    inner: InMemoryCheckpointStore,
    delay: Mutex<Duration>,
}

impl SlowStore {
    pub fn new(retention: RetentionPolicy, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryCheckpointStore::new(retention),
            delay: Mutex::new(delay),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl CheckpointStore for SlowStore {
    fn retention(&self) -> RetentionPolicy {
        self.inner.retention()
    }

    async fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        incarnation: Incarnation,
    ) -> StoreResult<GlobalStateIndex> {
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.inner.store_checkpoint(checkpoint, incarnation).await
    }

    async fn last_checkpoint(&self, unit: UnitId) -> StoreResult<Checkpoint> {
        self.inner.last_checkpoint(unit).await
    }

    async fn checkpoint(&self, unit: UnitId, seq: SequenceNumber) -> StoreResult<Checkpoint> {
        self.inner.checkpoint(unit, seq).await
    }

    async fn history(&self, unit: UnitId) -> StoreResult<Vec<Checkpoint>> {
        self.inner.history(unit).await
    }

    async fn store_request(&self, unit: UnitId, request: Request) -> StoreResult<()> {
        self.inner.store_request(unit, request).await
    }

    async fn store_reply(&self, unit: UnitId, reply: Reply) -> StoreResult<()> {
        self.inner.store_reply(unit, reply).await
    }

    async fn message_log(&self, unit: UnitId) -> StoreResult<Vec<MessageLogEntry>> {
        self.inner.message_log(unit).await
    }

    async fn global_state(&self) -> StoreResult<GlobalStateIndex> {
        self.inner.global_state().await
    }

    async fn incarnation(&self, unit: UnitId) -> StoreResult<Incarnation> {
        self.inner.incarnation(unit).await
    }

    async fn fence(&self, unit: UnitId, incarnation: Incarnation) -> StoreResult<()> {
        self.inner.fence(unit, incarnation).await
    }

    async fn units(&self) -> StoreResult<Vec<UnitSummary>> {
        self.inner.units().await
    }

    async fn initialize(&self) -> StoreResult<()> {
        self.inner.initialize().await
    }
}
