//! Checkpointing protocols and manager settings.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ftpool_checkpoint::{RetentionPolicy, StoreCapabilities};

use crate::backoff::BackoffPolicy;

/// Checkpointing protocol of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Pessimistic message logging: every received message is logged before
    /// it is queued, checkpoints are periodic and only the latest is kept.
    MessageLogging,
    /// Communication-induced checkpointing: messages carry the sender's
    /// checkpoint index, a higher index forces a checkpoint, and every
    /// checkpoint is kept.
    CommunicationInduced,
}

impl Protocol {
    /// Retention the protocol needs from its store.
    pub fn retention(self) -> RetentionPolicy {
        match self {
            Protocol::MessageLogging => RetentionPolicy::LatestOnly,
            Protocol::CommunicationInduced => RetentionPolicy::History,
        }
    }

    /// Returns whether a store with `capabilities` can serve this protocol.
    pub fn supported_by(self, capabilities: StoreCapabilities) -> bool {
        match self {
            Protocol::MessageLogging => capabilities.message_log,
            Protocol::CommunicationInduced => capabilities.history,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::MessageLogging => f.write_str("pml"),
            Protocol::CommunicationInduced => f.write_str("cic"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pml" | "message-logging" => Ok(Protocol::MessageLogging),
            "cic" | "communication-induced" => Ok(Protocol::CommunicationInduced),
            other => Err(format!("unknown protocol '{other}' (expected pml or cic)")),
        }
    }
}

/// Settings of a fault-tolerance manager.
#[derive(Debug, Clone)]
pub struct FtConfig {
    pub protocol: Protocol,
    /// Time to checkpoint: the interval between periodic checkpoints.
    pub ttc: Duration,
    /// Bound on capturing and storing one checkpoint.
    pub checkpoint_timeout: Duration,
    /// Delays between attempts to deliver to an unreachable destination.
    pub resend: BackoffPolicy,
}

impl Default for FtConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::MessageLogging,
            ttc: Duration::from_millis(30_000),
            checkpoint_timeout: Duration::from_millis(5_000),
            resend: BackoffPolicy {
                base: Duration::from_millis(3_000),
                max: Duration::from_secs(30),
                jitter: 0.25,
            },
        }
    }
}
