//! The central registry a node source reports to.

use std::sync::Mutex;

use async_trait::async_trait;
use ftpool_id::NodeUrl;
use serde::Serialize;
use tracing::info;

/// Outbound notifications from a node source to the central registry.
///
/// The registry keeps global accounting only; the node source stays
/// authoritative over its own records, so these calls cannot fail.
#[async_trait]
pub trait Registry: Send + Sync {
    /// A node joined the pool and can take work.
    async fn register_available_node(&self, source: &str, url: &NodeUrl);

    /// A node should leave the pool once it is idle (or now, if `preempt`).
    async fn node_removal_node_source_request(&self, url: &NodeUrl, preempt: bool);

    /// A node stopped answering pings.
    async fn set_down_node(&self, url: &NodeUrl);

    /// The node source finished shutting down.
    async fn node_source_terminated(&self, source: &str);
}

/// One recorded registry notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RegistryCall {
    Available { source: String, url: NodeUrl },
    RemovalRequest { url: NodeUrl, preempt: bool },
    Down { url: NodeUrl },
    Terminated { source: String },
}

/// In-process registry that logs and records every notification.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    calls: Mutex<Vec<RegistryCall>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification received so far, in order.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// How many times `url` was reported down.
    pub fn down_reports(&self, url: &NodeUrl) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RegistryCall::Down { url: u } if u == url))
            .count()
    }

    /// Nodes that have a pending removal request.
    pub fn removal_requests(&self) -> Vec<(NodeUrl, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RegistryCall::RemovalRequest { url, preempt } => Some((url, preempt)),
                _ => None,
            })
            .collect()
    }

    pub fn terminated(&self, source: &str) -> bool {
        self.calls()
            .iter()
            .any(|call| matches!(call, RegistryCall::Terminated { source: s } if s == source))
    }

    fn record(&self, call: RegistryCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register_available_node(&self, source: &str, url: &NodeUrl) {
        info!(node_source = source, node_url = %url, "Node available");
        self.record(RegistryCall::Available {
            source: source.to_string(),
            url: url.clone(),
        });
    }

    async fn node_removal_node_source_request(&self, url: &NodeUrl, preempt: bool) {
        info!(node_url = %url, preempt, "Node removal requested");
        self.record(RegistryCall::RemovalRequest {
            url: url.clone(),
            preempt,
        });
    }

    async fn set_down_node(&self, url: &NodeUrl) {
        info!(node_url = %url, "Node down");
        self.record(RegistryCall::Down { url: url.clone() });
    }

    async fn node_source_terminated(&self, source: &str) {
        info!(node_source = source, "Node source terminated");
        self.record(RegistryCall::Terminated {
            source: source.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let registry = InMemoryRegistry::new();
        let a = NodeUrl::parse("tcp://host-a:1099/a").unwrap();

        registry.register_available_node("pool", &a).await;
        registry.set_down_node(&a).await;
        registry.set_down_node(&a).await;
        registry.node_source_terminated("pool").await;

        assert_eq!(registry.calls().len(), 4);
        assert_eq!(registry.down_reports(&a), 2);
        assert!(registry.terminated("pool"));
        assert!(!registry.terminated("other"));
    }
}
