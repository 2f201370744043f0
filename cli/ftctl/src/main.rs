//! ftctl - operator CLI for ftpool
//!
//! Inspects a SQLite checkpoint store written by `ft-server` and prints the
//! parameter schemas of the deployment plugins.

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
