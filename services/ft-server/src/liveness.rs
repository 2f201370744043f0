//! Liveness probing of the nodes of a node source.
//!
//! Every interval the monitor pings each `Up` or `ToBeReleased` node. Probes
//! run concurrently and each is bounded by its own timeout, so one hanging
//! node never delays the verdict on the others. A node that fails
//! `threshold` probes in a row is reported down to its node source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ftpool_id::NodeUrl;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::nodesource::{NodeHandle, NodeSourceError, NodeSourceHandle, RemoteError};

/// Probe settings.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub interval: Duration,
    /// Consecutive failed probes before a node is reported down.
    pub threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            threshold: 1,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Probes one node source.
pub struct LivenessMonitor {
    source: NodeSourceHandle,
    config: LivenessConfig,
    failures: HashMap<NodeUrl, u32>,
}

impl LivenessMonitor {
    pub fn new(source: NodeSourceHandle, mut config: LivenessConfig) -> Self {
        config.threshold = config.threshold.max(1);
        Self {
            source,
            config,
            failures: HashMap::new(),
        }
    }

    /// Current consecutive failure count of `url`.
    pub fn failures(&self, url: &NodeUrl) -> u32 {
        self.failures.get(url).copied().unwrap_or(0)
    }

    /// Runs one probe round and returns the nodes reported down.
    pub async fn probe_once(&mut self) -> Result<Vec<NodeUrl>, NodeSourceError> {
        let targets = self.source.probe_targets().await?;

        // Forget counters of nodes that left the pool
        self.failures
            .retain(|url, _| targets.iter().any(|t| t.url() == url));

        let limit = self.config.probe_timeout;
        let mut probes = JoinSet::new();
        for node in targets {
            probes.spawn(probe(node, limit));
        }

        let mut down = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (url, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Probe task failed");
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    if self.failures.remove(&url).is_some() {
                        info!(node_url = %url, "Node answers again");
                    }
                }
                Err(e) => {
                    let count = self.failures.entry(url.clone()).or_insert(0);
                    *count += 1;
                    let consecutive_failures = *count;

                    if consecutive_failures < self.config.threshold {
                        warn!(node_url = %url, error = %e, consecutive_failures, "Probe failed");
                        continue;
                    }

                    error!(node_url = %url, error = %e, consecutive_failures, "Node is down");
                    self.failures.remove(&url);
                    self.source.detected_pinged_down_node(url.clone()).await?;
                    down.push(url);
                }
            }
        }

        down.sort();
        Ok(down)
    }

    /// Probes every interval until `shutdown` flips to `true` or the node
    /// source terminates.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            threshold = self.config.threshold,
            "Starting liveness monitor"
        );

        let mut terminated = self.source.terminated();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.probe_once().await {
                        Ok(down) if !down.is_empty() => {
                            debug!(count = down.len(), "Probe round found down nodes");
                        }
                        Ok(_) => {}
                        Err(NodeSourceError::Stopped) => {
                            info!("Node source stopped, liveness monitor exiting");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Probe round failed"),
                    }
                }
                changed = terminated.changed() => {
                    if changed.is_err() || *terminated.borrow() {
                        info!("Node source terminated, liveness monitor exiting");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Liveness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn probe(node: Arc<dyn NodeHandle>, limit: Duration) -> (NodeUrl, Result<(), RemoteError>) {
    let url = node.url().clone();
    let result = match tokio::time::timeout(limit, node.ping()).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            url: url.clone(),
            after: limit,
        }),
    };
    (url, result)
}
