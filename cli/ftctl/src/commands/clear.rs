//! Clearing a checkpoint store.

use anyhow::Result;
use clap::Args;
use ftpool_checkpoint::CheckpointStore;

use crate::error::CliError;
use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ClearArgs {
    /// Confirm deleting every checkpoint and message log.
    #[arg(long)]
    yes: bool,
}

impl ClearArgs {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        if !self.yes {
            return Err(CliError::NotConfirmed.into());
        }
        let store = ctx.open_store()?;
        let removed = clear(&store).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&serde_json::json!({ "cleared_units": removed })),
            OutputFormat::Table => {
                print_success(&format!("Cleared checkpoints of {removed} unit(s)"))
            }
        }
        Ok(())
    }
}

/// Empties the store and returns how many units it held.
async fn clear<S: CheckpointStore + ?Sized>(store: &S) -> Result<usize> {
    let units = store.units().await.map_err(CliError::from)?;
    store.initialize().await.map_err(CliError::from)?;
    Ok(units.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandContext;
    use ftpool_checkpoint::{
        Checkpoint, CheckpointInfo, RetentionPolicy, SqliteCheckpointStore, StateSnapshot,
    };
    use ftpool_id::{GlobalStateIndex, Incarnation, SequenceNumber, UnitId};

    #[tokio::test]
    async fn test_clear_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext {
            db: Some(dir.path().join("checkpoints.db")),
            retention: RetentionPolicy::LatestOnly,
            format: OutputFormat::Table,
        };

        let err = ClearArgs { yes: false }.run(ctx).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::NotConfirmed)
        ));
    }

    #[tokio::test]
    async fn test_clear_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteCheckpointStore::open(dir.path().join("checkpoints.db"), RetentionPolicy::LatestOnly)
                .unwrap();
        for _ in 0..2 {
            let checkpoint = Checkpoint::new(
                UnitId::new(),
                SequenceNumber::FIRST,
                Incarnation::FIRST,
                StateSnapshot::new(1, b"{}".to_vec()),
                CheckpointInfo::default(),
            );
            store
                .store_checkpoint(checkpoint, Incarnation::FIRST)
                .await
                .unwrap();
        }

        assert_eq!(clear(&store).await.unwrap(), 2);
        assert!(store.units().await.unwrap().is_empty());
        assert_eq!(store.global_state().await.unwrap(), GlobalStateIndex::NONE);
    }
}
