use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use constcat::concat;

use crate::{
    backend::PackCli,
    descriptor,
    docker::DockerCli,
    engine::{Engine, EngineOptions, EphemeralRegistry},
    registry::RegistryClient,
    Result,
};

const INSECURE_REGISTRY_VAR: &str = "SHIPYARD_INSECURE_REGISTRY";
const INSECURE_REGISTRIES_VAR: &str = "SHIPYARD_INSECURE_REGISTRIES";
const REGISTRY_CA_PATH_VAR: &str = "SHIPYARD_REGISTRY_CA_PATH";
const PACK_NETWORK_VAR: &str = "SHIPYARD_PACK_NETWORK";

/// Ephemeral builds push a single platform; this is the default when the
/// caller requested none.
const EPHEMERAL_DEFAULT_PLATFORM: &str = "linux/amd64";

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Registry repository to push to (overrides defaults)
    #[arg(long)]
    pub repo: Option<String>,

    /// Target platforms, comma-separated (e.g. linux/amd64,linux/arm64)
    #[arg(long)]
    pub platform: Option<String>,

    /// Push the built images to the registry
    #[arg(long, default_value_t)]
    pub push: bool,

    /// Path to the build descriptor
    #[arg(long, short = 'f', default_value = "build.yaml")]
    pub filename: PathBuf,

    /// Directory to output SBOMs
    #[arg(long = "sbom-output")]
    pub sbom_output: Option<String>,

    /// Seconds to wait for pushed references to become pullable
    #[arg(long = "propagation-timeout", default_value_t = 180)]
    pub propagation_timeout: u64,

    #[arg(
        long = "insecure-registry",
        help = concat!(
            "Registry host(s) to treat as insecure (self-signed TLS or HTTP), comma-separated. Also set via ",
            INSECURE_REGISTRY_VAR, " or ", INSECURE_REGISTRIES_VAR, "."
        )
    )]
    pub insecure_registry: Option<String>,

    /// Build only this artifact (exact image name from the descriptor)
    #[arg(long)]
    pub artifact: Option<String>,

    /// When set, push to ttl.sh/<ttl-uuid>-<suffix>:<ttl-tag> for ephemeral
    /// integration builds (overrides repo)
    #[arg(long = "ttl-uuid")]
    pub ttl_uuid: Option<String>,

    /// Tag for ttl.sh pushes when --ttl-uuid is set
    #[arg(long = "ttl-tag", default_value = "1h")]
    pub ttl_tag: String,
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

pub fn build(args: BuildArgs) -> Result<()> {
    let working_dir = std::env::current_dir()?;

    let descriptor_path = if args.filename.is_absolute() {
        args.filename.clone()
    } else {
        working_dir.join(&args.filename)
    };
    let artifacts = descriptor::load(&descriptor_path)?;

    let mut platforms = args
        .platform
        .as_deref()
        .map(split_csv)
        .unwrap_or_default();

    let ephemeral = args.ttl_uuid.clone().map(|uuid| EphemeralRegistry {
        uuid,
        tag: args.ttl_tag.clone(),
    });
    if ephemeral.is_some() {
        if platforms.is_empty() {
            platforms.push(EPHEMERAL_DEFAULT_PLATFORM.to_string());
        } else {
            platforms.truncate(1);
        }
    }

    let mut insecure_registries = Vec::new();
    for source in [
        env_non_empty(INSECURE_REGISTRY_VAR),
        env_non_empty(INSECURE_REGISTRIES_VAR),
        args.insecure_registry.clone(),
    ]
    .into_iter()
    .flatten()
    {
        insecure_registries.extend(split_csv(&source));
    }

    let options = EngineOptions {
        repository: args.repo.clone(),
        platforms,
        push: args.push,
        only_artifact: args.artifact.clone(),
        sbom_dir: args.sbom_output.clone(),
        insecure_registries,
        propagation_timeout: Duration::from_secs(args.propagation_timeout),
        ephemeral,
        ca_path: env_non_empty(REGISTRY_CA_PATH_VAR),
        network: env_non_empty(PACK_NETWORK_VAR),
        working_dir,
    };

    let registry = RegistryClient::new(&options.insecure_registries)?;
    let engine = Engine {
        backend: &PackCli,
        container: &DockerCli,
        registry: &registry,
    };

    engine.run(&artifacts, &options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_splitting_drops_empty_entries() {
        assert_eq!(split_csv("a,b"), ["a", "b"]);
        assert_eq!(split_csv("a,,b,"), ["a", "b"]);
        assert!(split_csv("").is_empty());
    }
}
