use std::path::PathBuf;

use clap::Args;

use crate::{registry::RegistryClient, Result};

#[derive(Debug, Args)]
pub struct PromoteArgs {
    /// Source environment (dev, pp, prod)
    #[arg(long, required = true)]
    pub source: String,

    /// Destination environment (pp, prod)
    #[arg(long, required = true)]
    pub destination: String,

    /// Directory containing build_result.json (default: current directory)
    #[arg(long = "build-result-dir")]
    pub build_result_dir: Option<PathBuf>,

    /// Artifact name to promote (default: last entry in build_result.json)
    #[arg(long = "image-name")]
    pub image_name: Option<String>,
}

pub fn promote(args: PromoteArgs) -> Result<()> {
    let registry = RegistryClient::new(&[])?;

    crate::promote::promote(
        &registry,
        &crate::promote::PromoteOptions {
            source_environment: args.source,
            destination_environment: args.destination,
            build_result_dir: args.build_result_dir,
            image_name: args.image_name,
        },
    )
}
