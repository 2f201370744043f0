//! # ftpool-id
//!
//! Stable identifier types shared by the checkpoint store, the node pool and
//! the recovery machinery.
//!
//! ## ID Format
//!
//! Generated identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `unit_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `rjob_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Counters that only make sense relative to a unit (checkpoint sequence
//! numbers, incarnations) and the global state index are plain integer
//! newtypes. Node endpoints are validated [`NodeUrl`]s.

mod error;
mod macros;
mod types;
mod url;

pub use error::IdError;
pub use types::*;
pub use url::NodeUrl;

