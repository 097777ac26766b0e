mod build;
mod promote;
mod watch;

use clap::{Parser, Subcommand};

use crate::Result;

#[derive(Debug, Parser)]
#[command(name = "shipyard", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the descriptor's artifacts and record the build contract
    Build(build::BuildArgs),

    /// Copy a built artifact from one environment's registry to another
    #[command(name = "promote-image", arg_required_else_help = true)]
    PromoteImage(promote::PromoteArgs),

    /// Wait for a deployment to converge on the contracted image
    #[command(name = "watch-deployment", arg_required_else_help = true)]
    WatchDeployment(watch::WatchArgs),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Build(args) => build::build(args),
            Commands::PromoteImage(args) => promote::promote(args),
            Commands::WatchDeployment(args) => watch::watch(args),
        }
    }
}
