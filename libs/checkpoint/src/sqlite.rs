//! SQLite-backed checkpoint store.
//!
//! Every write runs in one transaction on a blocking thread. A single
//! connection is shared behind a mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ftpool_id::{GlobalStateIndex, Incarnation, SequenceNumber, UnitId};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Checkpoint, CheckpointInfo, LoggedMessage, MessageLogEntry, Reply, Request, StateSnapshot,
};
use crate::store::{advance_global_state, CheckpointStore, RetentionPolicy, UnitSummary};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS units (
    unit_id TEXT PRIMARY KEY,
    last_seq INTEGER NOT NULL DEFAULT 0,
    fence INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS checkpoints (
    unit_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    incarnation INTEGER NOT NULL,
    state_version INTEGER NOT NULL,
    state BLOB NOT NULL,
    info TEXT NOT NULL,
    taken_at INTEGER NOT NULL,
    PRIMARY KEY (unit_id, seq)
);

CREATE TABLE IF NOT EXISTS message_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_id TEXT NOT NULL,
    checkpoint_seq INTEGER NOT NULL,
    entry TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_message_log_unit ON message_log(unit_id, checkpoint_seq);

CREATE TABLE IF NOT EXISTS global_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO global_state (id, value) VALUES (1, 0);
"#;

/// Checkpoint store persisted in SQLite.
pub struct SqliteCheckpointStore {
    retention: RetentionPolicy,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, retention: RetentionPolicy) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        // WAL lets the CLI read while the server writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn, retention)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(retention: RetentionPolicy) -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, retention)
    }

    fn with_connection(conn: Connection, retention: RetentionPolicy) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!(%retention, "Checkpoint store schema ready");
        Ok(Self {
            retention,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::StorageUnavailable("connection lock poisoned".into()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::StorageUnavailable(format!("blocking task failed: {e}")))?
    }

    fn unsupported(&self, operation: &'static str) -> StoreError {
        StoreError::NotSupported {
            operation,
            policy: self.retention,
        }
    }

    async fn append(&self, unit: UnitId, message: LoggedMessage) -> StoreResult<()> {
        if !self.capabilities().message_log {
            return Err(self.unsupported("store_message"));
        }

        let kind = message.kind();
        let entry = serde_json::to_string(&message)?;
        let logged = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let last = unit_row(&tx, unit)?.map(|(seq, _)| seq).unwrap_or(0);
                if last == 0 {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO message_log (unit_id, checkpoint_seq, entry) VALUES (?1, ?2, ?3)",
                    params![unit.to_string(), last, entry],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !logged {
            debug!(unit_id = %unit, kind, "No checkpoint yet, message not logged");
        }
        Ok(())
    }
}

struct RawCheckpoint {
    unit_id: String,
    seq: i64,
    incarnation: i64,
    state_version: i64,
    state: Vec<u8>,
    info: String,
    taken_at: i64,
}

const CHECKPOINT_COLUMNS: &str =
    "unit_id, seq, incarnation, state_version, state, info, taken_at";

impl RawCheckpoint {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            unit_id: row.get(0)?,
            seq: row.get(1)?,
            incarnation: row.get(2)?,
            state_version: row.get(3)?,
            state: row.get(4)?,
            info: row.get(5)?,
            taken_at: row.get(6)?,
        })
    }

    fn decode(self) -> StoreResult<Checkpoint> {
        let unit_id =
            UnitId::parse(&self.unit_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let info: CheckpointInfo = serde_json::from_str(&self.info)?;
        let taken_at = DateTime::<Utc>::from_timestamp_millis(self.taken_at)
            .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {}", self.taken_at)))?;

        Ok(Checkpoint {
            unit_id,
            seq: SequenceNumber::new(to_u64(self.seq)?),
            incarnation: Incarnation::new(to_u32(self.incarnation)?),
            state: StateSnapshot::new(to_u32(self.state_version)?, self.state),
            info,
            taken_at,
        })
    }
}

fn to_u64(v: i64) -> StoreResult<u64> {
    u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative value {v}")))
}

fn to_u32(v: i64) -> StoreResult<u32> {
    u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("value {v} out of range")))
}

fn to_i64(v: u64) -> StoreResult<i64> {
    i64::try_from(v).map_err(|_| StoreError::Corrupt(format!("value {v} out of range")))
}

/// `(last_seq, fence)` of a unit, if known.
fn unit_row(tx: &Transaction<'_>, unit: UnitId) -> StoreResult<Option<(i64, i64)>> {
    Ok(tx
        .query_row(
            "SELECT last_seq, fence FROM units WHERE unit_id = ?1",
            params![unit.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    async fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        incarnation: Incarnation,
    ) -> StoreResult<GlobalStateIndex> {
        let retention = self.retention;
        let unit = checkpoint.unit_id;
        let seq = checkpoint.seq;
        let info = serde_json::to_string(&checkpoint.info)?;

        let global = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let unit_key = unit.to_string();
                let (last, fence) = unit_row(&tx, unit)?.unwrap_or((0, 1));

                let current = Incarnation::new(to_u32(fence)?);
                if incarnation < current {
                    return Err(StoreError::StaleIncarnation {
                        unit,
                        incarnation,
                        current,
                    });
                }
                let last = SequenceNumber::new(to_u64(last)?);
                if seq <= last {
                    return Err(StoreError::OutOfOrder { unit, seq, last });
                }

                let seq_raw = to_i64(seq.value())?;
                let fence = i64::from(current.max(incarnation).value());
                tx.execute(
                    "INSERT INTO units (unit_id, last_seq, fence) VALUES (?1, ?2, ?3)
                     ON CONFLICT(unit_id) DO UPDATE SET last_seq = excluded.last_seq, fence = excluded.fence",
                    params![unit_key, seq_raw, fence],
                )?;

                if retention == RetentionPolicy::LatestOnly {
                    tx.execute(
                        "DELETE FROM checkpoints WHERE unit_id = ?1",
                        params![unit_key],
                    )?;
                }
                tx.execute(
                    "DELETE FROM message_log WHERE unit_id = ?1",
                    params![unit_key],
                )?;
                tx.execute(
                    &format!("INSERT INTO checkpoints ({CHECKPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                    params![
                        unit_key,
                        seq_raw,
                        i64::from(checkpoint.incarnation.value()),
                        i64::from(checkpoint.state.version),
                        checkpoint.state.bytes,
                        info,
                        checkpoint.taken_at.timestamp_millis(),
                    ],
                )?;

                let current_global: i64 =
                    tx.query_row("SELECT value FROM global_state WHERE id = 1", [], |row| {
                        row.get(0)
                    })?;
                let lowest: Option<i64> = tx.query_row(
                    "SELECT MIN(last_seq) FROM units WHERE last_seq > 0",
                    [],
                    |row| row.get(0),
                )?;
                let lowest = lowest.map(to_u64).transpose()?.map(SequenceNumber::new);
                let global =
                    advance_global_state(GlobalStateIndex::new(to_u64(current_global)?), lowest);
                tx.execute(
                    "UPDATE global_state SET value = ?1 WHERE id = 1",
                    params![to_i64(global.value())?],
                )?;

                tx.commit()?;
                Ok(global)
            })
            .await?;

        debug!(unit_id = %unit, seq = %seq, global = %global, "Stored checkpoint");
        Ok(global)
    }

    async fn last_checkpoint(&self, unit: UnitId) -> StoreResult<Checkpoint> {
        let raw = self
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE unit_id = ?1
                             ORDER BY seq DESC LIMIT 1"
                        ),
                        params![unit.to_string()],
                        RawCheckpoint::from_row,
                    )
                    .optional()?)
            })
            .await?;

        raw.ok_or(StoreError::NotFound { unit, seq: None })?
            .decode()
    }

    async fn checkpoint(&self, unit: UnitId, seq: SequenceNumber) -> StoreResult<Checkpoint> {
        let seq_raw = to_i64(seq.value())?;
        let raw = self
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE unit_id = ?1 AND seq = ?2"
                        ),
                        params![unit.to_string(), seq_raw],
                        RawCheckpoint::from_row,
                    )
                    .optional()?)
            })
            .await?;

        raw.ok_or(StoreError::NotFound {
            unit,
            seq: Some(seq),
        })?
        .decode()
    }

    async fn history(&self, unit: UnitId) -> StoreResult<Vec<Checkpoint>> {
        if !self.capabilities().history {
            return Err(self.unsupported("history"));
        }

        let raws = self
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE unit_id = ?1 ORDER BY seq"
                ))?;
                let rows = stmt
                    .query_map(params![unit.to_string()], RawCheckpoint::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        raws.into_iter().map(RawCheckpoint::decode).collect()
    }

    async fn store_request(&self, unit: UnitId, request: Request) -> StoreResult<()> {
        self.append(unit, LoggedMessage::Request(request)).await
    }

    async fn store_reply(&self, unit: UnitId, reply: Reply) -> StoreResult<()> {
        self.append(unit, LoggedMessage::Reply(reply)).await
    }

    async fn message_log(&self, unit: UnitId) -> StoreResult<Vec<MessageLogEntry>> {
        let rows: Vec<(i64, String)> = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT checkpoint_seq, entry FROM message_log WHERE unit_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![unit.to_string()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(seq, entry)| {
                Ok(MessageLogEntry {
                    checkpoint_seq: SequenceNumber::new(to_u64(seq)?),
                    message: serde_json::from_str(&entry)?,
                })
            })
            .collect()
    }

    async fn global_state(&self) -> StoreResult<GlobalStateIndex> {
        let value: i64 = self
            .run(|conn| {
                Ok(conn.query_row("SELECT value FROM global_state WHERE id = 1", [], |row| {
                    row.get(0)
                })?)
            })
            .await?;
        Ok(GlobalStateIndex::new(to_u64(value)?))
    }

    async fn incarnation(&self, unit: UnitId) -> StoreResult<Incarnation> {
        let fence: Option<i64> = self
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT fence FROM units WHERE unit_id = ?1",
                        params![unit.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        match fence {
            Some(v) => Ok(Incarnation::new(to_u32(v)?)),
            None => Ok(Incarnation::FIRST),
        }
    }

    async fn fence(&self, unit: UnitId, incarnation: Incarnation) -> StoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO units (unit_id, fence) VALUES (?1, ?2)
                 ON CONFLICT(unit_id) DO UPDATE SET fence = MAX(fence, excluded.fence)",
                params![unit.to_string(), i64::from(incarnation.value())],
            )?;
            Ok(())
        })
        .await
    }

    async fn units(&self) -> StoreResult<Vec<UnitSummary>> {
        let rows: Vec<(String, i64, i64, i64, i64)> = self
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT u.unit_id, u.last_seq, u.fence,
                        (SELECT COUNT(*) FROM checkpoints c WHERE c.unit_id = u.unit_id),
                        (SELECT COUNT(*) FROM message_log m WHERE m.unit_id = u.unit_id)
                     FROM units u ORDER BY u.unit_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(unit_id, last_seq, fence, checkpoints, log_entries)| {
                Ok(UnitSummary {
                    unit_id: UnitId::parse(&unit_id)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    last_seq: SequenceNumber::new(to_u64(last_seq)?),
                    incarnation: Incarnation::new(to_u32(fence)?),
                    checkpoints: usize::try_from(checkpoints).unwrap_or_default(),
                    log_entries: usize::try_from(log_entries).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn initialize(&self) -> StoreResult<()> {
        self.run(|conn| {
            conn.execute_batch(
                "DELETE FROM message_log;
                 DELETE FROM checkpoints;
                 DELETE FROM units;
                 UPDATE global_state SET value = 0 WHERE id = 1;",
            )?;
            Ok(())
        })
        .await?;
        debug!("Checkpoint store initialized");
        Ok(())
    }
}
