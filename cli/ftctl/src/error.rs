//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use ftpool_checkpoint::StoreError;
use ftpool_id::IdError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No checkpoint database at {}", .0.display())]
    NoDatabase(PathBuf),

    #[error("The store is configured as 'memory'; there is no database to inspect")]
    MemoryStore,

    #[error("Invalid unit ID '{input}': {source}")]
    InvalidUnit {
        input: String,
        #[source]
        source: IdError,
    },

    #[error("Refusing to clear the store without --yes")]
    NotConfirmed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NoDatabase(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Pass --db or set FTPOOL_STORE to the path ft-server writes to.".yellow()
                );
            }
            CliError::MemoryStore => {
                eprintln!(
                    "\n{}",
                    "Hint: In-memory checkpoints live only inside the running server.".yellow()
                );
            }
            CliError::InvalidUnit { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Unit IDs look like unit_01ARZ3NDEKTSV4RRFFQ69G5FAV. See `ftctl units`."
                        .yellow()
                );
            }
            CliError::NotConfirmed => {
                eprintln!(
                    "\n{}",
                    "Hint: This deletes every checkpoint and message log. Re-run with --yes."
                        .yellow()
                );
            }
            CliError::Store(StoreError::NotSupported { .. }) => {
                eprintln!(
                    "\n{}",
                    "Hint: Use --retention to match the policy the server runs with.".yellow()
                );
            }
            CliError::Store(StoreError::NotFound { .. }) => {
                eprintln!(
                    "\n{}",
                    "Hint: Run `ftctl units` to list checkpointed units.".yellow()
                );
            }
            CliError::Store(_) => {}
        }
    }
}
