//! # ftpool-checkpoint
//!
//! Durable storage of unit checkpoints and of the messages a unit received
//! since its latest checkpoint.
//!
//! ## Retention
//!
//! A store runs with one [`RetentionPolicy`]:
//!
//! - `LatestOnly`: one checkpoint per unit, replaced on every store, plus a
//!   message log that is cleared whenever a newer checkpoint lands. Pairs
//!   with message-logging protocols.
//! - `History`: every checkpoint is kept and can be fetched by sequence
//!   number. No message log. Pairs with communication-induced protocols.
//!
//! Callers check [`CheckpointStore::capabilities`] before relying on either
//! feature; unsupported calls fail with [`StoreError::NotSupported`].
//!
//! ## Implementations
//!
//! - [`InMemoryCheckpointStore`]: process-local, for tests and single-host runs
//! - [`SqliteCheckpointStore`]: SQLite in WAL mode
//! - [`TimeoutStore`]: bounds every call of another store

mod error;
mod memory;
mod model;
mod sqlite;
mod store;
mod timeout;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryCheckpointStore;
pub use model::{
    Checkpoint, CheckpointInfo, FtTag, LoggedMessage, MessageLogEntry, Reply, Request,
    StateSnapshot,
};
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointStore, RetentionPolicy, StoreCapabilities, UnitSummary};
pub use timeout::TimeoutStore;
