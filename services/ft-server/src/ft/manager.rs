//! The per-unit fault-tolerance manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use ftpool_checkpoint::{
    Checkpoint, CheckpointInfo, CheckpointStore, FtTag, LoggedMessage, Reply, Request,
    StoreError,
};
use ftpool_id::{GlobalStateIndex, Incarnation, NodeUrl, SequenceNumber, UnitId};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::capture::StateCapture;
use super::error::FtError;
use super::protocol::{FtConfig, Protocol};
use super::restart::{RestartPackage, RestartPlan};
use super::transport::{Transport, TransportError};
use crate::directory::UnitDirectory;

/// Observable state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FtState {
    Running,
    Checkpointing,
    Recovering,
}

/// Outcome of one checkpoint attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Sequence number the attempt used. It is consumed even on failure.
    pub seq: SequenceNumber,
    pub result: Result<GlobalStateIndex, FtError>,
}

impl CheckpointReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fault tolerance for one unit.
///
/// Hooks take `&mut self`: a unit drives its manager from its own single
/// thread of control, so no two hooks of the same unit ever overlap.
pub struct FaultToleranceManager {
    unit: UnitId,
    config: FtConfig,
    store: Arc<dyn CheckpointStore>,
    directory: Arc<dyn UnitDirectory>,
    capture: Arc<dyn StateCapture>,
    host: Option<NodeUrl>,

    state: FtState,
    incarnation: Incarnation,
    /// Highest sequence number handed out so far.
    checkpoint_index: SequenceNumber,
    /// Sequence of the latest checkpoint the store accepted.
    last_stored: SequenceNumber,
    /// Index a received message asked us to reach before serving again.
    forced: Option<SequenceNumber>,
    last_checkpoint_at: Instant,

    next_request_id: u64,
    served_requests: u64,
    awaiting_reply: BTreeMap<u64, Request>,
    failed_checkpoints: u64,
}

impl std::fmt::Debug for FaultToleranceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultToleranceManager")
            .field("unit", &self.unit)
            .field("protocol", &self.config.protocol)
            .field("state", &self.state)
            .field("incarnation", &self.incarnation)
            .field("checkpoint_index", &self.checkpoint_index)
            .field("last_stored", &self.last_stored)
            .finish_non_exhaustive()
    }
}

impl FaultToleranceManager {
    /// Creates the manager of a freshly started unit.
    ///
    /// Fails if the store cannot serve the configured protocol.
    pub fn new(
        unit: UnitId,
        config: FtConfig,
        store: Arc<dyn CheckpointStore>,
        directory: Arc<dyn UnitDirectory>,
        capture: Arc<dyn StateCapture>,
    ) -> Result<Self, FtError> {
        if !config.protocol.supported_by(store.capabilities()) {
            return Err(FtError::Misconfigured(format!(
                "protocol {} needs a {} store, got {}",
                config.protocol,
                config.protocol.retention(),
                store.retention()
            )));
        }

        Ok(Self {
            unit,
            config,
            store,
            directory,
            capture,
            host: None,
            state: FtState::Running,
            incarnation: Incarnation::FIRST,
            checkpoint_index: SequenceNumber::ZERO,
            last_stored: SequenceNumber::ZERO,
            forced: None,
            last_checkpoint_at: Instant::now(),
            next_request_id: 1,
            served_requests: 0,
            awaiting_reply: BTreeMap::new(),
            failed_checkpoints: 0,
        })
    }

    /// Rebuilds the manager of a unit restarted from `package`.
    ///
    /// Restores the unit state through `capture`, then reinitializes the
    /// counters from the checkpoint. Returns the messages to replay and the
    /// requests to send again.
    pub async fn restore(
        config: FtConfig,
        store: Arc<dyn CheckpointStore>,
        directory: Arc<dyn UnitDirectory>,
        capture: Arc<dyn StateCapture>,
        package: &RestartPackage,
    ) -> Result<(Self, RestartPlan), FtError> {
        let mut manager = Self::new(package.unit(), config, store, directory, capture)?;
        manager.state = FtState::Recovering;

        manager.capture.restore(&package.checkpoint.state).await?;
        manager.before_restart_after_recovery(&package.checkpoint.info, package.previous_incarnation);
        manager.checkpoint_index = package.checkpoint.seq;
        manager.last_stored = package.checkpoint.seq;

        let replay = package.replay();
        let answered: Vec<u64> = replay
            .iter()
            .filter_map(|message| match message {
                LoggedMessage::Reply(reply) => Some(reply.request_id),
                LoggedMessage::Request(_) => None,
            })
            .collect();
        let resend = manager
            .awaiting_reply
            .values()
            .filter(|request| !answered.contains(&request.id))
            .cloned()
            .collect();

        manager.state = FtState::Running;
        info!(
            unit_id = %manager.unit,
            seq = %package.checkpoint.seq,
            incarnation = %manager.incarnation,
            replay = replay.len(),
            "Unit restored from checkpoint"
        );

        Ok((manager, RestartPlan { replay, resend }))
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    pub fn state(&self) -> FtState {
        self.state
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// Sequence of the latest checkpoint the store accepted.
    pub fn last_checkpoint_seq(&self) -> SequenceNumber {
        self.last_stored
    }

    /// Highest sequence number used by an attempt, successful or not.
    pub fn checkpoint_index(&self) -> SequenceNumber {
        self.checkpoint_index
    }

    pub fn failed_checkpoints(&self) -> u64 {
        self.failed_checkpoints
    }

    pub fn served_requests(&self) -> u64 {
        self.served_requests
    }

    /// Outgoing requests still waiting for a reply, oldest first.
    pub fn awaiting_reply(&self) -> Vec<Request> {
        self.awaiting_reply.values().cloned().collect()
    }

    /// Returns true once `ttc` has elapsed since the last attempt.
    /// Records the node the unit runs on. Later checkpoints carry it so a
    /// restarted server can find the unit again.
    pub fn set_host(&mut self, url: NodeUrl) {
        self.host = Some(url);
    }

    pub fn host(&self) -> Option<&NodeUrl> {
        self.host.as_ref()
    }

    pub fn checkpoint_due(&self) -> bool {
        self.last_checkpoint_at.elapsed() >= self.config.ttc
    }

    fn tag(&self) -> FtTag {
        FtTag {
            checkpoint_seq: self.checkpoint_index,
            incarnation: self.incarnation,
        }
    }

    fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            next_request_id: self.next_request_id,
            served_requests: self.served_requests,
            awaiting_reply: self.awaiting_reply(),
            host: self.host.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Checkpointing
    // -------------------------------------------------------------------------

    /// Takes a checkpoint now.
    ///
    /// A failed or timed-out attempt is logged and counted, and the unit
    /// keeps running; the next attempt comes at the next interval.
    pub async fn checkpoint(&mut self) -> CheckpointReport {
        let seq = match self.forced.take() {
            Some(target) if target > self.checkpoint_index => target,
            _ => self.checkpoint_index.next(),
        };
        self.checkpoint_index = seq;
        self.state = FtState::Checkpointing;

        let limit = self.config.checkpoint_timeout;
        let result = match tokio::time::timeout(limit, self.capture_and_store(seq)).await {
            Ok(result) => result,
            Err(_) => Err(FtError::Store(StoreError::StorageUnavailable(format!(
                "checkpoint {seq} not stored within {limit:?}"
            )))),
        };

        self.state = FtState::Running;
        self.last_checkpoint_at = Instant::now();

        match &result {
            Ok(global) => {
                self.last_stored = seq;
                debug!(unit_id = %self.unit, seq = %seq, global = %global, "Checkpoint stored");
            }
            Err(FtError::Store(StoreError::StaleIncarnation { current, .. })) => {
                self.failed_checkpoints += 1;
                error!(
                    unit_id = %self.unit,
                    seq = %seq,
                    incarnation = %self.incarnation,
                    current = %current,
                    "Checkpoint refused, this incarnation has been superseded"
                );
            }
            Err(e) => {
                self.failed_checkpoints += 1;
                warn!(
                    unit_id = %self.unit,
                    seq = %seq,
                    error = %e,
                    failed_checkpoints = self.failed_checkpoints,
                    "Checkpoint failed, unit continues without it"
                );
            }
        }

        CheckpointReport { seq, result }
    }

    async fn capture_and_store(&self, seq: SequenceNumber) -> Result<GlobalStateIndex, FtError> {
        let state = self.capture.snapshot().await?;
        let checkpoint = Checkpoint::new(self.unit, seq, self.incarnation, state, self.info());
        Ok(self
            .store
            .store_checkpoint(checkpoint, self.incarnation)
            .await?)
    }

    /// Checkpoints if `ttc` has elapsed. Meant for idle units.
    pub async fn checkpoint_if_due(&mut self) -> Option<CheckpointReport> {
        if self.checkpoint_due() {
            Some(self.checkpoint().await)
        } else {
            None
        }
    }

    /// Output commit: a message leaving the fault-tolerant set must follow
    /// a checkpoint.
    async fn output_commit(&mut self, target: UnitId) -> Option<CheckpointReport> {
        if self.config.protocol != Protocol::CommunicationInduced {
            return None;
        }
        if self.directory.health(target).await.is_some() {
            return None;
        }
        debug!(unit_id = %self.unit, target = %target, "Output commit");
        Some(self.checkpoint().await)
    }

    fn note_incoming_index(&mut self, tag: FtTag) {
        if self.config.protocol != Protocol::CommunicationInduced {
            return;
        }
        if tag.checkpoint_seq > self.checkpoint_index
            && self.forced.is_none_or(|pending| tag.checkpoint_seq > pending)
        {
            debug!(
                unit_id = %self.unit,
                received = %tag.checkpoint_seq,
                local = %self.checkpoint_index,
                "Checkpoint forced by incoming message"
            );
            self.forced = Some(tag.checkpoint_seq);
        }
    }

    async fn log_message(&self, message: LoggedMessage) {
        if self.config.protocol != Protocol::MessageLogging {
            return;
        }
        let kind = message.kind();
        let stored = match message {
            LoggedMessage::Request(request) => self.store.store_request(self.unit, request).await,
            LoggedMessage::Reply(reply) => self.store.store_reply(self.unit, reply).await,
        };
        if let Err(e) = stored {
            warn!(unit_id = %self.unit, kind, error = %e, "Message not logged");
        }
    }

    // -------------------------------------------------------------------------
    // Hooks
    // -------------------------------------------------------------------------

    /// Called before a received request is queued.
    pub async fn on_receive_request(&mut self, request: &Request) {
        self.note_incoming_index(request.tag);
        self.log_message(LoggedMessage::Request(request.clone())).await;
    }

    /// Called before a received reply is handed to the unit.
    pub async fn on_receive_reply(&mut self, reply: &Reply) {
        self.note_incoming_index(reply.tag);
        if self.awaiting_reply.remove(&reply.request_id).is_none() {
            debug!(unit_id = %self.unit, request_id = reply.request_id, "Reply to an unknown request");
        }
        self.log_message(LoggedMessage::Reply(reply.clone())).await;
    }

    /// Called right before `request` is served.
    pub async fn on_serve_request_before(&mut self, request: &Request) -> Option<CheckpointReport> {
        if self.forced.is_some() {
            debug!(unit_id = %self.unit, method = %request.method, "Forced checkpoint before serving");
            return Some(self.checkpoint().await);
        }
        None
    }

    /// Called after `request` was served.
    pub async fn on_serve_request_after(&mut self, request: &Request) -> Option<CheckpointReport> {
        self.served_requests += 1;
        if self.checkpoint_due() {
            debug!(unit_id = %self.unit, method = %request.method, "Time to checkpoint");
            return Some(self.checkpoint().await);
        }
        None
    }

    /// Numbers and stamps an outgoing request.
    pub async fn on_send_request_before(&mut self, request: &mut Request) -> Option<CheckpointReport> {
        let report = self.output_commit(request.target).await;
        request.id = self.next_request_id;
        self.next_request_id += 1;
        request.sender = self.unit;
        request.tag = self.tag();
        report
    }

    /// Records that `request` now waits for a reply.
    pub fn on_send_request_after(&mut self, request: &Request) {
        self.awaiting_reply.insert(request.id, request.clone());
    }

    /// Stamps an outgoing reply.
    pub async fn on_send_reply_before(&mut self, reply: &mut Reply) -> Option<CheckpointReport> {
        let report = self.output_commit(reply.target).await;
        reply.sender = self.unit;
        reply.tag = self.tag();
        report
    }

    pub fn on_send_reply_after(&mut self, reply: &Reply) {
        debug!(unit_id = %self.unit, request_id = reply.request_id, target = %reply.target, "Reply sent");
    }

    /// Resets the counters of a unit resuming from a checkpoint.
    ///
    /// `previous` is the incarnation that failed; the unit continues as the
    /// next one.
    pub fn before_restart_after_recovery(&mut self, info: &CheckpointInfo, previous: Incarnation) {
        self.next_request_id = info.next_request_id.max(1);
        self.served_requests = info.served_requests;
        self.awaiting_reply = info
            .awaiting_reply
            .iter()
            .map(|request| (request.id, request.clone()))
            .collect();
        self.incarnation = previous.next();
        self.forced = None;
        self.last_checkpoint_at = Instant::now();
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Sends a request through the hooks, retrying while the destination is
    /// unreachable. Returns the request as sent.
    pub async fn send_request(
        &mut self,
        transport: &dyn Transport,
        mut request: Request,
    ) -> Result<Request, FtError> {
        self.on_send_request_before(&mut request).await;
        self.deliver(transport, Outgoing::Request(&request)).await?;
        self.on_send_request_after(&request);
        Ok(request)
    }

    /// Sends a reply through the hooks, retrying while the destination is
    /// unreachable.
    pub async fn send_reply(
        &mut self,
        transport: &dyn Transport,
        mut reply: Reply,
    ) -> Result<Reply, FtError> {
        self.on_send_reply_before(&mut reply).await;
        self.deliver(transport, Outgoing::Reply(&reply)).await?;
        self.on_send_reply_after(&reply);
        Ok(reply)
    }

    async fn deliver(&self, transport: &dyn Transport, message: Outgoing<'_>) -> Result<(), FtError> {
        let target = message.target();

        let mut attempt = 0u32;
        loop {
            let sent = match message {
                Outgoing::Request(request) => transport.deliver_request(request).await,
                Outgoing::Reply(reply) => transport.deliver_reply(reply).await,
            };

            let reason = match sent {
                Ok(()) => return Ok(()),
                Err(TransportError::Unreachable { reason, .. }) => reason,
                Err(e @ TransportError::Rejected { .. }) => return Err(e.into()),
            };

            if self
                .directory
                .health(target)
                .await
                .is_some_and(|health| health.is_unreachable())
            {
                warn!(unit_id = %self.unit, target = %target, attempts = attempt + 1, "Destination is down, giving up");
                return Err(FtError::DestinationDown(target));
            }

            let delay = self.config.resend.delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                unit_id = %self.unit,
                target = %target,
                kind = message.kind(),
                reason = %reason,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Destination unreachable, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Clone, Copy)]
enum Outgoing<'a> {
    Request(&'a Request),
    Reply(&'a Reply),
}

impl Outgoing<'_> {
    fn target(self) -> UnitId {
        match self {
            Outgoing::Request(request) => request.target,
            Outgoing::Reply(reply) => reply.target,
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Outgoing::Request(_) => "request",
            Outgoing::Reply(_) => "reply",
        }
    }
}
