use std::path::PathBuf;

use crate::{process, Result};

/// BuildKit wraps pushed images in an OCI index holding a provenance
/// child unless this is set. Manifest-list assembly requires every
/// per-platform reference to resolve to a plain image, so it is set on
/// every dispatch and must not be overridden to `0`.
const NO_DEFAULT_ATTESTATIONS: (&str, &str) = ("BUILDX_NO_DEFAULT_ATTESTATIONS", "1");

/// Partial implementation of the JSON emitted by the `--metadata-file`
/// option of `docker build`.
/// See https://docs.docker.com/reference/cli/docker/buildx/build/#metadata-file.
#[derive(serde::Deserialize)]
struct MetadataFile {
    #[serde(rename = "containerimage.digest")]
    containerimage_digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerBuildOptions {
    /// Target tag for this invocation.
    pub tag: String,

    /// Target platform (`os/arch`); `None` builds for the host.
    pub platform: Option<String>,

    pub push: bool,

    pub dockerfile: PathBuf,

    /// Build context directory.
    pub context: PathBuf,
}

/// The dockerfile build seam. The production implementation shells out to
/// the container runtime; tests substitute a recording fake.
pub trait ContainerBuild {
    /// One per-platform build-and-push, used by the multi-platform
    /// fan-out. The caller assembles the manifest list afterwards.
    fn build_platform(&self, options: &ContainerBuildOptions) -> Result<()>;

    /// A whole build delegated to the runtime. Returns the resulting tag;
    /// when pushing, the tag carries the digest reported by the runtime's
    /// metadata file.
    fn build(&self, options: &ContainerBuildOptions) -> Result<String>;
}

pub struct DockerCli;

/// Common flags for a `docker build` invocation; the caller appends its
/// output flags and the build context.
fn base_command(options: &ContainerBuildOptions) -> process::Command {
    let mut command = process::command!("docker", "build")
        .env(NO_DEFAULT_ATTESTATIONS.0, NO_DEFAULT_ATTESTATIONS.1);

    if let Some(platform) = &options.platform {
        command = process::args!(command, "--platform", platform);
    }

    process::args!(command, "--tag", options.tag, "--file", options.dockerfile)
}

impl ContainerBuild for DockerCli {
    fn build_platform(&self, options: &ContainerBuildOptions) -> Result<()> {
        process::args!(base_command(options), "--push", options.context)
            .status()
            .map_err(|error| format!("docker build of {tag} failed: {error}", tag = options.tag))?;
        Ok(())
    }

    fn build(&self, options: &ContainerBuildOptions) -> Result<String> {
        if !options.push {
            process::args!(base_command(options), "--load", options.context)
                .status()
                .map_err(|error| {
                    format!("docker build of {tag} failed: {error}", tag = options.tag)
                })?;
            return Ok(options.tag.clone());
        }

        let metadata_file = tempfile::Builder::new()
            .prefix("shipyard-build-metadata-")
            .suffix(".json")
            .tempfile()?;

        process::args!(base_command(options), "--push", "--metadata-file")
            .arg(metadata_file.path())
            .arg(&options.context)
            .status()
            .map_err(|error| format!("docker build of {tag} failed: {error}", tag = options.tag))?;

        let metadata: MetadataFile =
            serde_json::from_str(&std::fs::read_to_string(metadata_file.path())?)?;

        Ok(format!(
            "{tag}@{digest}",
            tag = options.tag,
            digest = metadata.containerimage_digest
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_file_parses_digest() {
        let metadata: MetadataFile = serde_json::from_str(
            r#"{"buildx.build.ref": "builder/builder0/x", "containerimage.digest": "sha256:abc"}"#,
        )
        .unwrap();
        assert_eq!(metadata.containerimage_digest, "sha256:abc");
    }
}
