//! Handles on remote node runtimes.
//!
//! The remoting layer is an external collaborator; the pool only needs to
//! resolve a URL, ping the node and ask its runtime to exit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ftpool_id::NodeUrl;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Errors from calls to a remote node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The node did not answer; usually it is already gone.
    #[error("node {url} unreachable: {reason}")]
    Unreachable { url: NodeUrl, reason: String },

    /// The call did not finish in time.
    #[error("call to node {url} timed out after {after:?}")]
    Timeout { url: NodeUrl, after: Duration },

    /// The handle cannot perform the operation.
    #[error("operation '{operation}' not supported for node {url}")]
    Unsupported {
        url: NodeUrl,
        operation: &'static str,
    },
}

/// A resolved node runtime.
#[async_trait]
pub trait NodeHandle: Send + Sync + fmt::Debug {
    fn url(&self) -> &NodeUrl;

    /// Succeeds if the node runtime answers.
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Asks the node runtime to terminate.
    async fn kill_runtime(&self) -> Result<(), RemoteError>;
}

/// Resolves node URLs into handles.
#[async_trait]
pub trait NodeLookup: Send + Sync {
    async fn lookup(&self, url: &NodeUrl) -> Result<Arc<dyn NodeHandle>, RemoteError>;
}

/// Resolves `url` within `limit`.
pub async fn lookup_within(
    lookup: &dyn NodeLookup,
    url: &NodeUrl,
    limit: Duration,
) -> Result<Arc<dyn NodeHandle>, RemoteError> {
    match tokio::time::timeout(limit, lookup.lookup(url)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            url: url.clone(),
            after: limit,
        }),
    }
}

/// Port assumed when a node URL carries none.
pub const DEFAULT_NODE_PORT: u16 = 1099;

/// Lookup that treats a node as alive while its endpoint accepts TCP
/// connections.
///
/// Plain TCP offers no way to stop a runtime, so `kill_runtime` reports
/// `Unsupported`; removal logs it and proceeds.
#[derive(Debug, Clone)]
pub struct TcpNodeLookup {
    connect_timeout: Duration,
}

impl TcpNodeLookup {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl NodeLookup for TcpNodeLookup {
    async fn lookup(&self, url: &NodeUrl) -> Result<Arc<dyn NodeHandle>, RemoteError> {
        let node = TcpNode {
            url: url.clone(),
            addr: format!("{}:{}", url.host(), url.port().unwrap_or(DEFAULT_NODE_PORT)),
            connect_timeout: self.connect_timeout,
        };
        node.ping().await?;
        Ok(Arc::new(node))
    }
}

#[derive(Debug)]
struct TcpNode {
    url: NodeUrl,
    addr: String,
    connect_timeout: Duration,
}

#[async_trait]
impl NodeHandle for TcpNode {
    fn url(&self) -> &NodeUrl {
        &self.url
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => {
                debug!(node_url = %self.url, "Node is alive");
                Ok(())
            }
            Ok(Err(e)) => Err(RemoteError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RemoteError::Timeout {
                url: self.url.clone(),
                after: self.connect_timeout,
            }),
        }
    }

    async fn kill_runtime(&self) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported {
            url: self.url.clone(),
            operation: "kill_runtime",
        })
    }
}
