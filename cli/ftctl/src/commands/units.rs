//! Unit commands (checkpoints and message logs).

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use ftpool_checkpoint::{Checkpoint, CheckpointStore, LoggedMessage, MessageLogEntry, UnitSummary};
use ftpool_id::{SequenceNumber, UnitId};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_info, print_output, print_single, OutputFormat};

use super::{parse_unit, CommandContext};

/// Longest state preview shown in tables.
const PREVIEW_CHARS: usize = 48;

#[derive(Debug, Args)]
pub struct UnitsArgs {}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Unit ID.
    unit: String,

    /// Sequence number of an older checkpoint (history retention).
    #[arg(long)]
    seq: Option<u64>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Unit ID.
    unit: String,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Unit ID.
    unit: String,
}

impl UnitsArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.open_store()?;
        let rows = unit_rows(&store).await?;
        let global = store.global_state().await.map_err(CliError::from)?;

        print_output(&rows, ctx.format);
        if ctx.format == OutputFormat::Table && !rows.is_empty() {
            print_info(&format!("Global state index: {global}"));
        }
        Ok(())
    }
}

impl ShowArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let unit = parse_unit(&self.unit)?;
        let store = ctx.open_store()?;
        let detail = checkpoint_detail(&store, unit, self.seq.map(SequenceNumber::new)).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&detail),
            OutputFormat::Table => print_output(&detail.fields(), ctx.format),
        }
        Ok(())
    }
}

impl HistoryArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let unit = parse_unit(&self.unit)?;
        let store = ctx.open_store()?;
        let rows = history_rows(&store, unit).await?;

        print_output(&rows, ctx.format);
        Ok(())
    }
}

impl LogArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let unit = parse_unit(&self.unit)?;
        let store = ctx.open_store()?;
        let rows = log_rows(&store, unit).await?;

        print_output(&rows, ctx.format);
        Ok(())
    }
}

/// One line of `ftctl units`.
#[derive(Debug, Clone, Serialize, Tabled)]
struct UnitRow {
    #[tabled(rename = "Unit")]
    unit_id: String,

    #[tabled(rename = "Last Seq")]
    last_seq: u64,

    #[tabled(rename = "Incarnation")]
    incarnation: u32,

    #[tabled(rename = "Checkpoints")]
    checkpoints: usize,

    #[tabled(rename = "Logged")]
    log_entries: usize,
}

impl From<UnitSummary> for UnitRow {
    fn from(summary: UnitSummary) -> Self {
        Self {
            unit_id: summary.unit_id.to_string(),
            last_seq: summary.last_seq.value(),
            incarnation: summary.incarnation.value(),
            checkpoints: summary.checkpoints,
            log_entries: summary.log_entries,
        }
    }
}

/// One line of `ftctl history`.
#[derive(Debug, Clone, Serialize, Tabled)]
struct CheckpointRow {
    #[tabled(rename = "Seq")]
    seq: u64,

    #[tabled(rename = "Incarnation")]
    incarnation: u32,

    #[tabled(rename = "Version")]
    state_version: u32,

    #[tabled(rename = "Bytes")]
    state_bytes: usize,

    #[tabled(rename = "Taken")]
    taken_at: String,
}

impl From<&Checkpoint> for CheckpointRow {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            seq: checkpoint.seq.value(),
            incarnation: checkpoint.incarnation.value(),
            state_version: checkpoint.state.version,
            state_bytes: checkpoint.state.bytes.len(),
            taken_at: checkpoint.taken_at.to_rfc3339(),
        }
    }
}

/// One line of `ftctl log`.
#[derive(Debug, Clone, Serialize, Tabled)]
struct LogRow {
    #[tabled(rename = "#")]
    position: usize,

    #[tabled(rename = "After Seq")]
    checkpoint_seq: u64,

    #[tabled(rename = "Kind")]
    kind: &'static str,

    #[tabled(rename = "Request")]
    request_id: u64,

    #[tabled(rename = "From")]
    sender: String,

    #[tabled(rename = "To")]
    target: String,

    #[tabled(rename = "Method", display = "display_option")]
    method: Option<String>,

    #[tabled(rename = "Bytes")]
    payload_bytes: usize,
}

impl LogRow {
    fn new(position: usize, entry: &MessageLogEntry) -> Self {
        let (request_id, sender, target, method, payload_bytes) = match &entry.message {
            LoggedMessage::Request(request) => (
                request.id,
                request.sender,
                request.target,
                Some(request.method.clone()),
                request.payload.len(),
            ),
            LoggedMessage::Reply(reply) => (
                reply.request_id,
                reply.sender,
                reply.target,
                None,
                reply.payload.len(),
            ),
        };
        Self {
            position,
            checkpoint_seq: entry.checkpoint_seq.value(),
            kind: entry.message.kind(),
            request_id,
            sender: sender.to_string(),
            target: target.to_string(),
            method,
            payload_bytes,
        }
    }
}

/// Everything `ftctl show` knows about one checkpoint.
#[derive(Debug, Clone, Serialize)]
struct CheckpointDetail {
    unit_id: UnitId,
    seq: u64,
    incarnation: u32,
    taken_at: DateTime<Utc>,
    state_version: u32,
    state_bytes: usize,
    /// The state itself when it is valid UTF-8.
    state: Option<String>,
    next_request_id: u64,
    served_requests: u64,
    awaiting_reply: Vec<u64>,
}

impl From<Checkpoint> for CheckpointDetail {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            unit_id: checkpoint.unit_id,
            seq: checkpoint.seq.value(),
            incarnation: checkpoint.incarnation.value(),
            taken_at: checkpoint.taken_at,
            state_version: checkpoint.state.version,
            state_bytes: checkpoint.state.bytes.len(),
            state: String::from_utf8(checkpoint.state.bytes).ok(),
            next_request_id: checkpoint.info.next_request_id,
            served_requests: checkpoint.info.served_requests,
            awaiting_reply: checkpoint
                .info
                .awaiting_reply
                .iter()
                .map(|request| request.id)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct Field {
    #[tabled(rename = "Field")]
    name: &'static str,

    #[tabled(rename = "Value")]
    value: String,
}

impl CheckpointDetail {
    fn fields(&self) -> Vec<Field> {
        let field = |name, value: String| Field { name, value };
        let awaiting = if self.awaiting_reply.is_empty() {
            "-".to_string()
        } else {
            self.awaiting_reply
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };

        vec![
            field("Unit", self.unit_id.to_string()),
            field("Seq", self.seq.to_string()),
            field("Incarnation", self.incarnation.to_string()),
            field("Taken", self.taken_at.to_rfc3339()),
            field("State version", self.state_version.to_string()),
            field("State", preview(self.state.as_deref(), self.state_bytes)),
            field("Next request", self.next_request_id.to_string()),
            field("Served", self.served_requests.to_string()),
            field("Awaiting reply", awaiting),
        ]
    }
}

fn preview(state: Option<&str>, bytes: usize) -> String {
    match state {
        Some(text) if text.chars().count() <= PREVIEW_CHARS => text.to_string(),
        Some(text) => {
            let head: String = text.chars().take(PREVIEW_CHARS).collect();
            format!("{head}... ({bytes} bytes)")
        }
        None => format!("<{bytes} bytes, binary>"),
    }
}

fn display_option(opt: &Option<String>) -> String {
    opt.clone().unwrap_or_else(|| "-".to_string())
}

async fn unit_rows<S: CheckpointStore + ?Sized>(store: &S) -> Result<Vec<UnitRow>> {
    let units = store.units().await.map_err(CliError::from)?;
    Ok(units.into_iter().map(UnitRow::from).collect())
}

async fn checkpoint_detail<S: CheckpointStore + ?Sized>(
    store: &S,
    unit: UnitId,
    seq: Option<SequenceNumber>,
) -> Result<CheckpointDetail> {
    let checkpoint = match seq {
        Some(seq) => store.checkpoint(unit, seq).await,
        None => store.last_checkpoint(unit).await,
    }
    .map_err(CliError::from)?;
    Ok(checkpoint.into())
}

async fn history_rows<S: CheckpointStore + ?Sized>(
    store: &S,
    unit: UnitId,
) -> Result<Vec<CheckpointRow>> {
    let history = store.history(unit).await.map_err(CliError::from)?;
    Ok(history.iter().map(CheckpointRow::from).collect())
}

async fn log_rows<S: CheckpointStore + ?Sized>(store: &S, unit: UnitId) -> Result<Vec<LogRow>> {
    let log = store.message_log(unit).await.map_err(CliError::from)?;
    Ok(log
        .iter()
        .enumerate()
        .map(|(i, entry)| LogRow::new(i + 1, entry))
        .collect())
}
