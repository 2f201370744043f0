//! Typed ID and counter definitions.

use crate::macros::{define_counter, define_id};

// =============================================================================
// Generated identifiers
// =============================================================================

define_id!(
    /// A long-lived computational unit. Never reused within a run.
    UnitId,
    "unit"
);
define_id!(
    /// One recovery attempt for a unit.
    RecoveryJobId,
    "rjob"
);
define_id!(
    /// One elastic deployment started by a node source.
    DeploymentId,
    "dply"
);

// =============================================================================
// Counters
// =============================================================================

define_counter!(
    /// Checkpoint sequence number, strictly increasing per unit.
    ///
    /// `ZERO` means the unit has never checkpointed; the first stored
    /// checkpoint carries `FIRST`.
    SequenceNumber,
    u64
);

impl SequenceNumber {
    /// No checkpoint taken yet.
    pub const ZERO: Self = Self(0);

    /// Sequence number of the first checkpoint.
    pub const FIRST: Self = Self(1);
}

impl Default for SequenceNumber {
    fn default() -> Self {
        Self::ZERO
    }
}

define_counter!(
    /// How many times a unit has been restarted from a checkpoint, plus one.
    Incarnation,
    u32
);

impl Incarnation {
    /// Incarnation of a unit that has never been recovered.
    pub const FIRST: Self = Self(1);
}

impl Default for Incarnation {
    fn default() -> Self {
        Self::FIRST
    }
}

define_counter!(
    /// Highest checkpoint sequence that every known unit has reached.
    GlobalStateIndex,
    u64
);

impl GlobalStateIndex {
    /// No complete global state yet.
    pub const NONE: Self = Self(0);
}

impl Default for GlobalStateIndex {
    fn default() -> Self {
        Self::NONE
    }
}

// =============================================================================
// Tests
// =============================================================================
