use super::{BuildBackend, BuildOptions};
use crate::{process, Result};

/// Buildpack builds through the pack CLI. The builder is always trusted:
/// this tool only ever builds with builders the pipeline itself declares.
pub struct PackCli;

impl BuildBackend for PackCli {
    fn build(&self, options: &BuildOptions) -> Result<()> {
        let BuildOptions {
            image_name,
            builder,
            path,
            publish,
            run_image,
            platform,
            env,
            sbom_dir,
            insecure_registries,
            volumes,
            network,
        } = options;

        println!(
            "building {image_name} using builder {builder} (publish={publish})",
        );

        let mut command = process::command!(
            "pack",
            "build",
            image_name,
            "--builder",
            builder,
            "--path",
            path,
            "--trust-builder",
        );

        if *publish {
            command = command.arg("--publish");
        }
        if let Some(run_image) = run_image {
            command = process::args!(command, "--run-image", run_image);
        }
        if let Some(platform) = platform {
            command = process::args!(command, "--platform", platform);
        }
        for (key, value) in env {
            command = process::args!(command, "--env", format!("{key}={value}"));
        }
        if let Some(sbom_dir) = sbom_dir {
            command = process::args!(command, "--sbom-output-dir", sbom_dir);
        }
        for registry in insecure_registries {
            command = process::args!(command, "--insecure-registry", registry);
        }
        for volume in volumes {
            command = process::args!(command, "--volume", volume);
        }
        if let Some(network) = network {
            command = process::args!(command, "--network", network);
        }

        command
            .status()
            .map_err(|error| format!("pack build of {image_name} failed: {error}"))?;

        Ok(())
    }
}
