//! Per-unit fault tolerance.
//!
//! A [`FaultToleranceManager`] sits between one unit and the messaging
//! layer. It sees every request and reply the unit receives, serves and
//! sends, takes checkpoints through the unit's [`StateCapture`], and writes
//! them (plus the message log, when the protocol keeps one) to a
//! checkpoint store.
//!
//! ```text
//! RUNNING ──ttc / forced / output commit──> CHECKPOINTING ──> RUNNING
//! RUNNING ──host down, restart──────────> RECOVERING ────> RUNNING
//! ```

mod capture;
mod error;
mod manager;
mod protocol;
mod restart;
mod transport;

pub use capture::{CaptureError, StateCapture};
pub use error::FtError;
pub use manager::{CheckpointReport, FaultToleranceManager, FtState};
pub use protocol::{FtConfig, Protocol};
pub use restart::{RestartPackage, RestartPlan};
pub use transport::{Transport, TransportError};
