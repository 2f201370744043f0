//! Parse errors for identifiers and node URLs.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty identifier")]
    Empty,

    /// The identifier belongs to another kind (e.g. a job ID given for a unit).
    #[error("expected a '{expected}' identifier, got prefix '{found}'")]
    WrongPrefix {
        expected: &'static str,
        found: String,
    },

    #[error("identifier has no '_' between prefix and ULID")]
    MissingSeparator,

    #[error("bad ULID: {0}")]
    InvalidUlid(String),

    #[error("invalid node URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: &'static str },
}
