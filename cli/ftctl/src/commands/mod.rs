//! CLI commands.

mod clear;
mod params;
mod units;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ftpool_checkpoint::{RetentionPolicy, SqliteCheckpointStore};
use ftpool_id::UnitId;

use crate::config;
use crate::error::CliError;
use crate::output::OutputFormat;

/// ftpool operator CLI - inspect checkpoint stores and plugin schemas.
#[derive(Debug, Parser)]
#[command(name = "ftctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path of the SQLite checkpoint database.
    #[arg(long, global = true, env = "FTPOOL_STORE")]
    db: Option<PathBuf>,

    /// Retention policy the server runs the store with (latest or history).
    #[arg(long, global = true, env = "FTPOOL_RETENTION", default_value = "latest")]
    retention: RetentionPolicy,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List checkpointed units.
    Units(units::UnitsArgs),

    /// Show a unit's latest (or a given) checkpoint.
    Show(units::ShowArgs),

    /// List every stored checkpoint of a unit (history retention).
    History(units::HistoryArgs),

    /// Dump the messages logged since a unit's latest checkpoint.
    Log(units::LogArgs),

    /// Delete all checkpoints, logs and incarnations.
    Clear(clear::ClearArgs),

    /// Show the parameters a plugin accepts.
    Params(params::ParamsCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            db: self.db,
            retention: self.retention,
            format: OutputFormat::from_json_flag(self.json),
        };

        match self.command {
            Commands::Units(args) => args.run(ctx).await,
            Commands::Show(args) => args.run(ctx).await,
            Commands::History(args) => args.run(ctx).await,
            Commands::Log(args) => args.run(ctx).await,
            Commands::Clear(args) => args.run(ctx).await,
            Commands::Params(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("ftctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub db: Option<PathBuf>,
    pub retention: RetentionPolicy,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Opens the existing checkpoint database.
    ///
    /// Never creates one: a mistyped path would otherwise look like an
    /// empty store.
    pub fn open_store(&self) -> Result<SqliteCheckpointStore> {
        let path = config::resolve_database(self.db.as_deref())?;
        if !path.is_file() {
            return Err(CliError::NoDatabase(path).into());
        }
        let store = SqliteCheckpointStore::open(&path, self.retention).map_err(CliError::from)?;
        Ok(store)
    }
}

/// Parses a unit ID argument.
pub(crate) fn parse_unit(input: &str) -> Result<UnitId> {
    UnitId::parse(input).map_err(|source| {
        CliError::InvalidUnit {
            input: input.to_string(),
            source,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ftctl",
            "units",
            "--db",
            "/tmp/ft.db",
            "--retention",
            "history",
            "--json",
        ])
        .unwrap();

        assert_eq!(cli.db, Some(PathBuf::from("/tmp/ft.db")));
        assert_eq!(cli.retention, RetentionPolicy::History);
        assert!(cli.json);
    }

    #[test]
    fn unknown_retention_is_rejected() {
        assert!(Cli::try_parse_from(["ftctl", "--retention", "forever", "units"]).is_err());
    }

    #[test]
    fn missing_database_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let ctx = CommandContext {
            db: Some(path.clone()),
            retention: RetentionPolicy::LatestOnly,
            format: OutputFormat::Table,
        };

        let err = ctx.open_store().err().expect("missing database must not open");

        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::NoDatabase(p)) if p == &path
        ));
        assert!(!path.exists());
    }

    #[test]
    fn unit_argument_must_be_a_unit_id() {
        let err = parse_unit("rjob_01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::InvalidUnit { .. })
        ));

        let unit = UnitId::new();
        assert_eq!(parse_unit(&unit.to_string()).unwrap(), unit);
    }
}
