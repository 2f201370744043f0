//! Named pools of worker nodes.
//!
//! ```text
//! Deployment ──attach──┐
//! Registry ──add/remove┼──> NodeSourceActor ──notify──> Registry
//! LivenessMonitor ─down┘          │
//!                                 └──events──> FailureRouter
//! ```

pub mod deployment;
pub mod record;
pub mod registry;
pub mod remote;
pub mod source;

pub use deployment::{AttachSink, Deployment, DeploymentError};
pub use record::{NodeEvent, NodeRecord, NodeSourceStatus, NodeState, RemovalReason, RemovedNode};
pub use registry::{InMemoryRegistry, Registry, RegistryCall};
pub use remote::{lookup_within, NodeHandle, NodeLookup, RemoteError, TcpNodeLookup};
pub use source::{
    NodeSourceConfig, NodeSourceError, NodeSourceHandle, NodeSourceMessage, DEFAULT_SOURCE_NAME,
};
