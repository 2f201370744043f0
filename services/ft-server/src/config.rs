//! Configuration for the fault-tolerance server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ftpool_checkpoint::RetentionPolicy;
use ftpool_id::NodeUrl;

use crate::backoff::BackoffPolicy;
use crate::ft::{FtConfig, Protocol};
use crate::liveness::LivenessConfig;
use crate::nodesource::{NodeSourceConfig, DEFAULT_SOURCE_NAME};
use crate::recovery::RecoveryConfig;

/// Where checkpoints are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    Sqlite(PathBuf),
}

impl StoreLocation {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "memory" | ":memory:" => StoreLocation::Memory,
            path => StoreLocation::Sqlite(PathBuf::from(path)),
        }
    }
}

/// Fault-tolerance server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Time to checkpoint.
    pub ttc: Duration,
    pub checkpoint_timeout: Duration,
    pub store: StoreLocation,
    pub retention: RetentionPolicy,
    pub protocol: Protocol,

    pub liveness_interval: Duration,
    pub liveness_threshold: u32,
    pub probe_timeout: Duration,

    pub recovery_timeout: Duration,
    pub resend_interval: Duration,
    pub node_lookup_timeout: Duration,

    pub node_source: String,
    /// Nodes registered at startup.
    pub static_nodes: Vec<NodeUrl>,
    /// Program run on a node to restart a unit.
    pub restart_command: String,
    /// How long a graceful shutdown waits for nodes to drain.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let millis = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                None => Ok(Duration::from_millis(default)),
                Some(raw) => {
                    let ms: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a number of milliseconds, got '{raw}'"))?;
                    if ms == 0 {
                        bail!("{key} must be greater than zero");
                    }
                    Ok(Duration::from_millis(ms))
                }
            }
        };

        let retention = match lookup("FTPOOL_RETENTION") {
            Some(raw) => raw
                .parse::<RetentionPolicy>()
                .map_err(anyhow::Error::msg)
                .context("invalid FTPOOL_RETENTION")?,
            None => RetentionPolicy::LatestOnly,
        };

        let protocol = match lookup("FTPOOL_PROTOCOL") {
            Some(raw) => raw
                .parse::<Protocol>()
                .map_err(anyhow::Error::msg)
                .context("invalid FTPOOL_PROTOCOL")?,
            None => Protocol::MessageLogging,
        };

        if protocol.retention() != retention {
            bail!(
                "protocol {protocol} needs {} retention, but FTPOOL_RETENTION is {retention}",
                protocol.retention()
            );
        }

        let liveness_threshold = match lookup("FTPOOL_LIVENESS_THRESHOLD") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("FTPOOL_LIVENESS_THRESHOLD must be a count, got '{raw}'"))?,
            None => 1,
        };
        if liveness_threshold == 0 {
            bail!("FTPOOL_LIVENESS_THRESHOLD must be at least 1");
        }

        let static_nodes = lookup("FTPOOL_STATIC_NODES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| NodeUrl::parse(s).with_context(|| format!("invalid node URL in FTPOOL_STATIC_NODES: '{s}'")))
            .collect::<Result<Vec<_>>>()?;

        let node_source = lookup("FTPOOL_NODE_SOURCE")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SOURCE_NAME.to_string());

        Ok(Self {
            ttc: millis("FTPOOL_TTC_MS", 30_000)?,
            checkpoint_timeout: millis("FTPOOL_CHECKPOINT_TIMEOUT_MS", 5_000)?,
            store: StoreLocation::parse(&lookup("FTPOOL_STORE").unwrap_or_default()),
            retention,
            protocol,
            liveness_interval: millis("FTPOOL_LIVENESS_INTERVAL_MS", 10_000)?,
            liveness_threshold,
            probe_timeout: millis("FTPOOL_PROBE_TIMEOUT_MS", 3_000)?,
            recovery_timeout: millis("FTPOOL_RECOVERY_TIMEOUT_MS", 60_000)?,
            resend_interval: millis("FTPOOL_RESEND_INTERVAL_MS", 3_000)?,
            node_lookup_timeout: millis("FTPOOL_NODE_LOOKUP_TIMEOUT_MS", 5_000)?,
            node_source,
            static_nodes,
            restart_command: lookup("FTPOOL_RESTART_COMMAND")
                .unwrap_or_else(|| "ftpool-unit".to_string()),
            shutdown_grace: millis("FTPOOL_SHUTDOWN_GRACE_MS", 30_000)?,
            log_level: lookup("FTPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn ft_config(&self) -> FtConfig {
        FtConfig {
            protocol: self.protocol,
            ttc: self.ttc,
            checkpoint_timeout: self.checkpoint_timeout,
            resend: BackoffPolicy {
                base: self.resend_interval,
                max: self.resend_interval.max(Duration::from_secs(30)),
                jitter: 0.25,
            },
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            interval: self.liveness_interval,
            threshold: self.liveness_threshold,
            probe_timeout: self.probe_timeout,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            timeout: self.recovery_timeout,
            ..RecoveryConfig::default()
        }
    }

    pub fn node_source_config(&self) -> NodeSourceConfig {
        NodeSourceConfig {
            name: self.node_source.clone(),
            lookup_timeout: self.node_lookup_timeout,
            kill_timeout: self.node_lookup_timeout,
            ..NodeSourceConfig::default()
        }
    }
}
