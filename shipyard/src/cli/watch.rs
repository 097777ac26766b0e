use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::{watch::WatchOptions, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Polls until the named Deployment's image tag matches the one from
/// build_result.json, then runs a rollout-status wait to confirm the
/// rollout completes within the given timeout.
///
/// When the descriptor defines multiple artifacts, use --image-name to
/// select which artifact's tag to watch for. Defaults to the last entry
/// (the application image; base images come first by convention).
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Deployment (and HelmRelease) name
    #[arg(long, required = true)]
    pub component: String,

    /// Target environment (dev, pp, prod)
    #[arg(long, required = true)]
    pub environment: String,

    /// Kubernetes namespace
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Rollout-status timeout (kubectl duration, e.g. 30m)
    #[arg(long, default_value = "30m")]
    pub timeout: String,

    /// Directory containing build_result.json (default: current directory)
    #[arg(long = "build-result-dir")]
    pub build_result_dir: Option<PathBuf>,

    /// Artifact name to watch for (default: last entry in build_result.json)
    #[arg(long = "image-name")]
    pub image_name: Option<String>,

    /// Seconds to poll before failing
    #[arg(long = "poll-timeout", default_value_t = 600)]
    pub poll_timeout: u64,
}

pub fn watch(args: WatchArgs) -> Result<()> {
    crate::watch::run(&WatchOptions {
        component: args.component,
        environment: args.environment,
        namespace: args.namespace,
        rollout_timeout: args.timeout,
        build_result_dir: args.build_result_dir,
        image_name: args.image_name,
        poll_timeout: Duration::from_secs(args.poll_timeout),
        poll_interval: POLL_INTERVAL,
    })
}
