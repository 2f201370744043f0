//! ftpool fault-tolerance server library
//!
//! Keeps a pool of worker nodes consistent with a central registry and
//! recovers the units running on those nodes from their checkpoints when a
//! host disappears.
//!
//! ## Architecture
//!
//! ```text
//! NodeSourceActor  <── add / remove / shutdown (registry, deployments)
//!   ^   │ events
//!   │   v
//!   │ FailureRouter ──> RecoveryCoordinator ──> CheckpointStore
//!   │                        │                   ^
//! LivenessMonitor            └──> UnitRestarter  │
//!                                                │
//! FaultToleranceManager (one per unit) ──────────┘
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework the node source runs on
//! - `backoff`: Retry delays
//! - `nodesource`: Node pools, their registry and deployments
//! - `liveness`: Periodic node probing
//! - `ft`: Per-unit checkpointing and message logging
//! - `recovery`: Restarting units from checkpoints
//! - `failover`: Wiring down-node events to recovery
//! - `launch`, `hosts`, `params`: Starting node runtimes

pub mod actors;
pub mod backoff;
pub mod config;
pub mod directory;
pub mod failover;
pub mod ft;
pub mod hosts;
pub mod launch;
pub mod liveness;
pub mod nodesource;
pub mod params;
pub mod recovery;

// Re-export commonly used types
pub use directory::{InMemoryDirectory, UnitDirectory, UnitHealth};
pub use failover::{adopt_checkpointed_units, FailureRouter};
pub use ft::{FaultToleranceManager, FtConfig, FtError, Protocol};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use nodesource::{NodeSourceConfig, NodeSourceError, NodeSourceHandle};
pub use recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryError, RecoveryOutcome};
