//! Locating the checkpoint database.

use std::path::{Path, PathBuf};

use anyhow::Result;
use directories::ProjectDirs;

use crate::error::CliError;

/// File name of the default database.
const DATABASE_FILE: &str = "checkpoints.db";

/// Get the data directory path.
fn data_dir() -> Result<PathBuf> {
    ProjectDirs::from("org", "ftpool", "ftpool")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
}

/// Default location of the checkpoint database.
pub fn default_database() -> Result<PathBuf> {
    Ok(data_dir()?.join(DATABASE_FILE))
}

/// Resolves the `--db` value to a database file.
///
/// `FTPOOL_STORE` is shared with the server, so the server's `memory`
/// setting can show up here; there is nothing on disk to open in that case.
pub fn resolve_database(value: Option<&Path>) -> Result<PathBuf> {
    match value {
        Some(path) if path.as_os_str().eq_ignore_ascii_case("memory") => {
            Err(CliError::MemoryStore.into())
        }
        Some(path) => Ok(path.to_path_buf()),
        None => default_database(),
    }
}
