//! Plugin parameter schemas.

use anyhow::Result;
use clap::{Args, Subcommand};
use ftpool_server::hosts::HostListDeployment;
use ftpool_server::params::{render_cli_help, Configurable, ParamDescriptor};

use crate::output::{print_single, OutputFormat};

use super::CommandContext;

/// Parameter commands.
#[derive(Debug, Args)]
pub struct ParamsCommand {
    #[command(subcommand)]
    command: ParamsSubcommand,
}

#[derive(Debug, Subcommand)]
enum ParamsSubcommand {
    /// Parameters of the host-list deployment.
    HostList,
}

impl ParamsCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let (name, descriptors) = match self.command {
            ParamsSubcommand::HostList => ("host-list", HostListDeployment::parameters()),
        };
        print_params(name, &descriptors, ctx.format);
        Ok(())
    }
}

fn print_params(name: &str, descriptors: &[ParamDescriptor], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_single(&descriptors),
        OutputFormat::Table => {
            println!("{name} parameters:");
            print!("{}", render_cli_help(descriptors));
        }
    }
}
