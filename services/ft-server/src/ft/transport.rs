//! Delivery of requests and replies between units.

use async_trait::async_trait;
use ftpool_checkpoint::{Reply, Request};
use ftpool_id::UnitId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The destination could not be reached; the send may be retried.
    #[error("unit {target} unreachable: {reason}")]
    Unreachable { target: UnitId, reason: String },

    /// The destination refused the message; retrying will not help.
    #[error("unit {target} rejected the message: {reason}")]
    Rejected { target: UnitId, reason: String },
}

/// Point-to-point delivery provided by the remoting layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver_request(&self, request: &Request) -> Result<(), TransportError>;

    async fn deliver_reply(&self, reply: &Reply) -> Result<(), TransportError>;
}
