//! Elastic deployments that feed nodes into a node source.

use async_trait::async_trait;
use ftpool_id::{DeploymentId, NodeUrl};
use thiserror::Error;
use tracing::{info, warn};

use super::record::NodeRecord;
use super::source::{NodeSourceError, NodeSourceHandle};

/// Errors from a deployment run.
#[derive(Debug, Error)]
pub enum DeploymentError {
    /// No node came up.
    #[error("deployment '{name}' attached no node ({failed} launch(es) failed)")]
    NothingAttached { name: String, failed: usize },

    /// The deployment could not be started.
    #[error("deployment '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Something that starts node runtimes and reports them as they attach.
#[async_trait]
pub trait Deployment: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the nodes; each node that comes up is handed to `sink`.
    ///
    /// Returns once every launch has either attached or given up.
    async fn deploy(&self, sink: AttachSink) -> Result<(), DeploymentError>;
}

/// Callback path through which a running deployment attaches nodes.
#[derive(Clone)]
pub struct AttachSink {
    source: NodeSourceHandle,
    deployment: DeploymentId,
}

impl AttachSink {
    pub(crate) fn new(source: NodeSourceHandle, deployment: DeploymentId) -> Self {
        Self { source, deployment }
    }

    pub fn deployment(&self) -> DeploymentId {
        self.deployment
    }

    /// Adds the node to the source, exactly like a direct add request.
    pub async fn attach(&self, url: NodeUrl) -> Result<NodeRecord, NodeSourceError> {
        match self.source.add_node(url.clone()).await {
            Ok(record) => {
                info!(deployment_id = %self.deployment, node_url = %url, "Deployed node attached");
                Ok(record)
            }
            Err(e) => {
                warn!(
                    deployment_id = %self.deployment,
                    node_url = %url,
                    error = %e,
                    "Deployed node rejected"
                );
                Err(e)
            }
        }
    }
}
