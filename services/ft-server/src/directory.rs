//! Where each unit runs, and whether it is healthy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ftpool_id::{NodeUrl, UnitId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::nodesource::{lookup_within, NodeLookup};

/// Health of a unit as seen by the fault-tolerance server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitHealth {
    Alive,
    /// Its host stopped answering.
    Down,
    /// Being restarted from a checkpoint.
    Recovering,
    /// Could not be recovered; stays failed.
    Failed,
}

impl UnitHealth {
    /// Messages to a unit in this state will never be delivered.
    pub fn is_unreachable(self) -> bool {
        matches!(self, UnitHealth::Down | UnitHealth::Failed)
    }
}

impl fmt::Display for UnitHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitHealth::Alive => "alive",
            UnitHealth::Down => "down",
            UnitHealth::Recovering => "recovering",
            UnitHealth::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("unit {0} is not registered")]
    UnknownUnit(UnitId),
}

/// Why a unit ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Location and health registry for units.
#[async_trait]
pub trait UnitDirectory: Send + Sync {
    /// Records that `unit` now runs on `url` and is alive.
    async fn register(&self, unit: UnitId, url: NodeUrl);

    async fn location(&self, unit: UnitId) -> Option<NodeUrl>;

    /// Units currently located on `url`.
    async fn units_on(&self, url: &NodeUrl) -> Vec<UnitId>;

    /// `None` for units the directory has never seen.
    async fn health(&self, unit: UnitId) -> Option<UnitHealth>;

    async fn set_health(&self, unit: UnitId, health: UnitHealth) -> Result<(), DirectoryError>;

    /// Marks `unit` permanently failed and keeps `reason` for inspection.
    async fn mark_failed(&self, unit: UnitId, reason: String);

    async fn failure(&self, unit: UnitId) -> Option<UnitFailure>;

    /// Probes the host `unit` is located on.
    async fn is_reachable(&self, unit: UnitId) -> bool;
}

#[derive(Debug)]
struct Entry {
    location: Option<NodeUrl>,
    health: UnitHealth,
    failure: Option<UnitFailure>,
}

/// Directory kept in process memory.
pub struct InMemoryDirectory {
    lookup: Arc<dyn NodeLookup>,
    probe_timeout: Duration,
    units: RwLock<HashMap<UnitId, Entry>>,
}

impl InMemoryDirectory {
    pub fn new(lookup: Arc<dyn NodeLookup>, probe_timeout: Duration) -> Self {
        Self {
            lookup,
            probe_timeout,
            units: RwLock::new(HashMap::new()),
        }
    }

    /// Every known unit with its health, ordered by id.
    pub async fn snapshot(&self) -> Vec<(UnitId, Option<NodeUrl>, UnitHealth)> {
        let units = self.units.read().await;
        let mut all: Vec<_> = units
            .iter()
            .map(|(id, e)| (*id, e.location.clone(), e.health))
            .collect();
        all.sort_by_key(|(id, _, _)| *id);
        all
    }
}

#[async_trait]
impl UnitDirectory for InMemoryDirectory {
    async fn register(&self, unit: UnitId, url: NodeUrl) {
        info!(unit_id = %unit, node_url = %url, "Unit located");
        self.units.write().await.insert(
            unit,
            Entry {
                location: Some(url),
                health: UnitHealth::Alive,
                failure: None,
            },
        );
    }

    async fn location(&self, unit: UnitId) -> Option<NodeUrl> {
        self.units
            .read()
            .await
            .get(&unit)
            .and_then(|e| e.location.clone())
    }

    async fn units_on(&self, url: &NodeUrl) -> Vec<UnitId> {
        let units = self.units.read().await;
        let mut hosted: Vec<UnitId> = units
            .iter()
            .filter(|(_, e)| e.location.as_ref() == Some(url))
            .map(|(id, _)| *id)
            .collect();
        hosted.sort();
        hosted
    }

    async fn health(&self, unit: UnitId) -> Option<UnitHealth> {
        self.units.read().await.get(&unit).map(|e| e.health)
    }

    async fn set_health(&self, unit: UnitId, health: UnitHealth) -> Result<(), DirectoryError> {
        let mut units = self.units.write().await;
        let entry = units
            .get_mut(&unit)
            .ok_or(DirectoryError::UnknownUnit(unit))?;
        if entry.health != health {
            debug!(unit_id = %unit, from = %entry.health, to = %health, "Unit health changed");
        }
        entry.health = health;
        Ok(())
    }

    async fn mark_failed(&self, unit: UnitId, reason: String) {
        error!(unit_id = %unit, reason = %reason, "Unit failed");
        let failure = UnitFailure {
            reason,
            failed_at: Utc::now(),
        };
        let mut units = self.units.write().await;
        match units.get_mut(&unit) {
            Some(entry) => {
                entry.health = UnitHealth::Failed;
                entry.failure = Some(failure);
            }
            None => {
                units.insert(
                    unit,
                    Entry {
                        location: None,
                        health: UnitHealth::Failed,
                        failure: Some(failure),
                    },
                );
            }
        }
    }

    async fn failure(&self, unit: UnitId) -> Option<UnitFailure> {
        self.units
            .read()
            .await
            .get(&unit)
            .and_then(|e| e.failure.clone())
    }

    async fn is_reachable(&self, unit: UnitId) -> bool {
        let Some(url) = self.location(unit).await else {
            return false;
        };

        let handle = match lookup_within(self.lookup.as_ref(), &url, self.probe_timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(unit_id = %unit, node_url = %url, error = %e, "Unit host unreachable");
                return false;
            }
        };
        matches!(
            tokio::time::timeout(self.probe_timeout, handle.ping()).await,
            Ok(Ok(()))
        )
    }
}
