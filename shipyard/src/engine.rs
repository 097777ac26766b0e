use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use constcat::concat;
use itertools::Itertools;
use log::warn;

use crate::{
    backend::{BuildBackend, BuildOptions},
    contract::{BuildEntry, BuildResult},
    descriptor::{Artifact, ArtifactKind},
    docker::{ContainerBuild, ContainerBuildOptions},
    registry::{self, Registry, RemoteManifest},
    Result,
};

pub const EPHEMERAL_REGISTRY_HOST: &str = "ttl.sh";

/// Where a caller-supplied CA certificate is mounted inside build
/// containers.
pub const CA_CONTAINER_PATH: &str = "/etc/ssl/certs/registry-ca.crt";
const CA_VOLUME_SUFFIX: &str = concat!(":", CA_CONTAINER_PATH, ":ro");

/// Environment variables that may carry a version tag. CI matrix jobs
/// often pass platform-suffixed tags through these.
const VERSION_ENV_VARS: &[&str] = &[
    "DOCKER_METADATA_OUTPUT_VERSION",
    "SKAFFOLD_TAG",
    "VERSION",
    "TAG",
    "IMAGE_TAG",
];

const PLATFORM_SUFFIX_MARKER: &str = "_linux_";

const LOCAL_REGISTRY: &str = "localhost:5001";
const LOOPBACK_REGISTRY: &str = "127.0.0.1:5001";

const PROPAGATION_POLL_PERIOD: Duration = Duration::from_secs(3);

const DEFAULT_MODULE_PRIVACY: &str = "github.com/*";

/// Push target for ephemeral integration builds:
/// `ttl.sh/<uuid>-<suffix>:<tag>`.
#[derive(Debug, Clone)]
pub struct EphemeralRegistry {
    pub uuid: String,
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Registry repository the artifact image names are appended to.
    pub repository: Option<String>,

    /// Requested target platforms; empty means host-default.
    pub platforms: Vec<String>,

    pub push: bool,

    /// Restrict the build to a single artifact by image name.
    pub only_artifact: Option<String>,

    pub sbom_dir: Option<String>,

    pub insecure_registries: Vec<String>,

    pub propagation_timeout: Duration,

    pub ephemeral: Option<EphemeralRegistry>,

    /// PEM file to mount into build containers for registries with a
    /// private CA.
    pub ca_path: Option<String>,

    /// Container network mode for buildpack builds.
    pub network: Option<String>,

    /// Working directory: artifact workspaces are resolved against it and
    /// the contract file is written into it.
    pub working_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            repository: None,
            platforms: Vec::new(),
            push: false,
            only_artifact: None,
            sbom_dir: None,
            insecure_registries: Vec::new(),
            propagation_timeout: Duration::from_secs(180),
            ephemeral: None,
            ca_path: None,
            network: None,
            working_dir: PathBuf::from("."),
        }
    }
}

/// The build orchestration loop: iterates artifacts in dependency order,
/// fans out per platform, and assembles manifest lists from the
/// per-platform pushes. Strictly sequential; the backends hold heavyweight
/// local resources and later artifacts need the pinned references of
/// earlier ones.
pub struct Engine<'a> {
    pub backend: &'a dyn BuildBackend,
    pub container: &'a dyn ContainerBuild,
    pub registry: &'a dyn Registry,
}

impl Engine<'_> {
    /// Builds every selected artifact and writes the contract file on
    /// success. No contract is written when any artifact fails or when
    /// zero artifacts were built.
    pub fn run(&self, artifacts: &[Artifact], options: &EngineOptions) -> Result<BuildResult> {
        let version = sanitize_version_env();
        self.run_with_version(artifacts, options, version)
    }

    pub fn run_with_version(
        &self,
        artifacts: &[Artifact],
        options: &EngineOptions,
        version: Option<String>,
    ) -> Result<BuildResult> {
        let selected = select_artifacts(artifacts, options.only_artifact.as_deref())?;

        let mut contract = BuildResult::default();
        // Completed symbolic names to stored references, for run-image
        // substitution in dependent artifacts.
        let mut built_index: HashMap<String, String> = HashMap::new();

        for artifact in selected {
            let full_tag = full_tag(&artifact.image_name, options);
            println!(
                "building artifact {name} -> {full_tag}",
                name = artifact.image_name
            );

            let entry = if options.push {
                self.build_and_push(artifact, &full_tag, options, version.as_deref(), &built_index)
            } else {
                self.build_delegated(artifact, &full_tag, options, &built_index)
            }?;

            built_index.insert(entry.image_name.clone(), entry.tag.clone());
            contract.builds.push(entry);
        }

        contract.write(&options.working_dir)?;
        Ok(contract)
    }

    fn build_and_push(
        &self,
        artifact: &Artifact,
        full_tag: &str,
        options: &EngineOptions,
        version: Option<&str>,
        built_index: &HashMap<String, String>,
    ) -> Result<BuildEntry> {
        let run_image = resolve_run_image(artifact, built_index);

        match artifact.kind {
            ArtifactKind::Chart => self.build_chart(artifact, full_tag, run_image, options),
            ArtifactKind::Buildpack => {
                self.build_buildpack(artifact, full_tag, run_image, options, version)
            }
            ArtifactKind::ContainerBuild => {
                if options.platforms.len() > 1 || options.ephemeral.is_some() {
                    self.build_container_fanout(artifact, full_tag, options, version)
                } else {
                    self.build_container_delegated(artifact, full_tag, options, true)
                }
            }
        }
    }

    /// Chart artifacts are not platform-specific and the buildpack's helm
    /// push is the only push: the lifecycle runs with publish disabled and
    /// reports the pushed reference through a file in the mounted output
    /// directory.
    fn build_chart(
        &self,
        artifact: &Artifact,
        full_tag: &str,
        run_image: Option<String>,
        options: &EngineOptions,
    ) -> Result<BuildEntry> {
        let output_dir = tempfile::Builder::new()
            .prefix("shipyard-helm-out-")
            .tempdir()
            .map_err(|error| format!("creating helm output dir: {error}"))?;

        let (mut env, mut volumes) = compose_build_env(artifact, options);

        // The helm OCI reference is the repository without the trailing
        // tag; helm push appends the chart version as the tag.
        let oci_ref = match full_tag.rfind(':') {
            Some(index) if index > 0 => &full_tag[..index],
            _ => full_tag,
        };
        env.insert("BP_HELM_OCI_REF".to_string(), oci_ref.to_string());
        env.insert("BP_HELM_OCI_OUTPUT".to_string(), "/out".to_string());
        volumes.push(format!("{dir}:/out", dir = output_dir.path().display()));

        self.backend
            .build(&BuildOptions {
                image_name: full_tag.to_string(),
                builder: required_builder(artifact)?,
                path: options.working_dir.join(&artifact.workspace),
                publish: false,
                run_image,
                platform: None,
                env,
                sbom_dir: options.sbom_dir.clone(),
                insecure_registries: options.insecure_registries.clone(),
                volumes,
                network: options.network.clone(),
            })
            .map_err(|error| {
                format!(
                    "buildpack build (chart) failed for {name}: {error}",
                    name = artifact.image_name
                )
            })?;

        let chart_ref = std::fs::read_to_string(output_dir.path().join("ref"))
            .map_err(|error| {
                format!(
                    "reading helm push ref for {name}: {error}",
                    name = artifact.image_name
                )
            })?
            .trim()
            .to_string();

        println!(
            "chart artifact {name} -> {chart_ref}",
            name = artifact.image_name
        );

        Ok(BuildEntry {
            image_name: artifact.image_name.clone(),
            tag: chart_ref,
        })
    }

    fn build_buildpack(
        &self,
        artifact: &Artifact,
        full_tag: &str,
        run_image: Option<String>,
        options: &EngineOptions,
        version: Option<&str>,
    ) -> Result<BuildEntry> {
        let platforms: Vec<String> = if options.platforms.is_empty() {
            vec![String::new()] // host-default
        } else {
            options.platforms.clone()
        };
        let multi_platform = platforms.len() > 1;

        let (env, volumes) = compose_build_env(artifact, options);

        let mut platform_tags: Vec<(String, String)> = Vec::new();

        for platform in &platforms {
            let platform_tag = if multi_platform && !platform.is_empty() {
                format!(
                    "{full_tag}-{sanitized}",
                    sanitized = platform.replace('/', "-")
                )
            } else {
                full_tag.to_string()
            };

            println!("  -> platform {platform:?}, tag {platform_tag}");

            // Registries on some container-runtime topologies are only
            // reachable via loopback from inside the build container.
            let mut insecure_registries = options.insecure_registries.clone();
            let (dispatch_tag, tag_rewritten) = rewrite_loopback(&platform_tag);
            let (dispatch_run_image, run_image_rewritten) = match run_image.as_deref() {
                Some(value) => {
                    let (rewritten, matched) = rewrite_loopback(value);
                    (Some(rewritten), matched)
                }
                None => (None, false),
            };
            if tag_rewritten || run_image_rewritten {
                insecure_registries.push(LOOPBACK_REGISTRY.to_string());
            }

            self.backend
                .build(&BuildOptions {
                    image_name: dispatch_tag,
                    builder: required_builder(artifact)?,
                    path: options.working_dir.join(&artifact.workspace),
                    publish: true,
                    run_image: dispatch_run_image,
                    platform: (!platform.is_empty()).then(|| platform.clone()),
                    env: env.clone(),
                    sbom_dir: options.sbom_dir.clone(),
                    insecure_registries,
                    volumes: volumes.clone(),
                    network: options.network.clone(),
                })
                .map_err(|error| {
                    format!(
                        "buildpack build failed for {name} ({platform}): {error}",
                        name = artifact.image_name
                    )
                })?;

            // The recorded tag keeps the original registry host, not the
            // loopback rewrite.
            platform_tags.push((platform.clone(), platform_tag));
        }

        let final_digest = if multi_platform {
            self.assemble_index(full_tag, &platform_tags)?
        } else {
            self.registry.head(full_tag).map_err(|error| {
                format!("resolving digest of {full_tag}: {error}")
            })?
        };

        let stored = format!("{full_tag}@{final_digest}");

        self.retag_version(full_tag, version)?;
        self.wait_for_propagation(full_tag, options);

        println!(
            "built {name} -> {stored}",
            name = artifact.image_name
        );

        Ok(BuildEntry {
            image_name: artifact.image_name.clone(),
            tag: stored,
        })
    }

    fn build_container_fanout(
        &self,
        artifact: &Artifact,
        full_tag: &str,
        options: &EngineOptions,
        version: Option<&str>,
    ) -> Result<BuildEntry> {
        let context = options.working_dir.join(&artifact.workspace);
        let dockerfile = dockerfile_path(artifact, &context);

        let mut platform_tags: Vec<(String, String)> = Vec::new();

        for platform in &options.platforms {
            let platform_tag = if options.ephemeral.is_some() && options.platforms.len() == 1 {
                full_tag.to_string()
            } else {
                format!(
                    "{full_tag}-{sanitized}",
                    sanitized = platform.replace('/', "-")
                )
            };

            println!(
                "building container artifact {name} for platform {platform} -> {platform_tag}",
                name = artifact.image_name
            );

            self.container
                .build_platform(&ContainerBuildOptions {
                    tag: platform_tag.clone(),
                    platform: Some(platform.clone()),
                    push: true,
                    dockerfile: dockerfile.clone(),
                    context: context.clone(),
                })
                .map_err(|error| {
                    format!(
                        "container build failed for {name} ({platform}): {error}",
                        name = artifact.image_name
                    )
                })?;

            platform_tags.push((platform.clone(), platform_tag));
        }

        let digest = self.assemble_index(full_tag, &platform_tags)?;
        let stored = format!("{full_tag}@{digest}");

        self.retag_version(full_tag, version)?;
        self.wait_for_propagation(full_tag, options);

        Ok(BuildEntry {
            image_name: artifact.image_name.clone(),
            tag: stored,
        })
    }

    fn build_container_delegated(
        &self,
        artifact: &Artifact,
        full_tag: &str,
        options: &EngineOptions,
        push: bool,
    ) -> Result<BuildEntry> {
        println!(
            "delegating container artifact {name} to the runtime",
            name = artifact.image_name
        );

        let context = options.working_dir.join(&artifact.workspace);
        let dockerfile = dockerfile_path(artifact, &context);

        let tag = self
            .container
            .build(&ContainerBuildOptions {
                tag: full_tag.to_string(),
                platform: options
                    .platforms
                    .first()
                    .filter(|platform| !platform.is_empty())
                    .cloned(),
                push,
                dockerfile,
                context,
            })
            .map_err(|error| {
                format!(
                    "container build failed for {name}: {error}",
                    name = artifact.image_name
                )
            })?;

        if push {
            self.wait_for_propagation(&tag, options);
        }

        Ok(BuildEntry {
            image_name: artifact.image_name.clone(),
            tag,
        })
    }

    /// The no-push path: the whole build is delegated to the backends and
    /// their returned tags become the contract entries, without digest
    /// resolution or propagation waits.
    fn build_delegated(
        &self,
        artifact: &Artifact,
        full_tag: &str,
        options: &EngineOptions,
        built_index: &HashMap<String, String>,
    ) -> Result<BuildEntry> {
        match artifact.kind {
            ArtifactKind::Buildpack | ArtifactKind::Chart => {
                let (env, volumes) = compose_build_env(artifact, options);
                self.backend
                    .build(&BuildOptions {
                        image_name: full_tag.to_string(),
                        builder: required_builder(artifact)?,
                        path: options.working_dir.join(&artifact.workspace),
                        publish: false,
                        run_image: resolve_run_image(artifact, built_index),
                        platform: options
                            .platforms
                            .first()
                            .filter(|platform| !platform.is_empty())
                            .cloned(),
                        env,
                        sbom_dir: options.sbom_dir.clone(),
                        insecure_registries: options.insecure_registries.clone(),
                        volumes,
                        network: options.network.clone(),
                    })
                    .map_err(|error| {
                        format!(
                            "buildpack build failed for {name}: {error}",
                            name = artifact.image_name
                        )
                    })?;

                Ok(BuildEntry {
                    image_name: artifact.image_name.clone(),
                    tag: full_tag.to_string(),
                })
            }
            ArtifactKind::ContainerBuild => {
                self.build_container_delegated(artifact, full_tag, options, false)
            }
        }
    }

    /// Assembles a Docker manifest list from the per-platform pushes and
    /// publishes it at `full_tag`. Returns the locally computed index
    /// digest, which is the artifact's final digest.
    fn assemble_index(
        &self,
        full_tag: &str,
        platform_tags: &[(String, String)],
    ) -> Result<String> {
        println!(
            "creating manifest list {full_tag} from [{tags}]",
            tags = platform_tags.iter().map(|(_, tag)| tag).join(", ")
        );

        let mut index = registry::manifest_list();

        for (platform, tag) in platform_tags {
            match self
                .registry
                .get(tag)
                .map_err(|error| format!("getting platform image {tag}: {error}"))?
            {
                RemoteManifest::Image(descriptor) => {
                    registry::append_platform_image(&mut index, &descriptor, platform);
                }
                RemoteManifest::Index(_) => {
                    return Err(format!(
                        "per-platform reference {tag} resolved to an index, expected an image"
                    )
                    .into())
                }
            }
        }

        self.registry.write_index(full_tag, &index)?;
        let digest = registry::index_digest(&index)?;

        println!("pushed manifest list {full_tag} (digest: {digest})");
        Ok(digest)
    }

    /// Re-publishes the final image or index under the canonical version
    /// tag. Content-preserving; a failure here is fatal because diverging
    /// `latest` and version references are unacceptable.
    fn retag_version(&self, full_tag: &str, version: Option<&str>) -> Result<()> {
        let Some(version) = version else {
            return Ok(());
        };

        let version_tag = format!(
            "{base}{version}",
            base = full_tag.strip_suffix("latest").unwrap_or(full_tag)
        );
        println!("tagging {full_tag} as {version_tag}");

        self.registry
            .copy(full_tag, &version_tag)
            .map_err(|error| format!("tagging version {version_tag:?}: {error}").into())
    }

    /// Some registries acknowledge writes before the manifest is readable;
    /// later pipeline steps pull immediately. Expiry is a warning, not a
    /// failure.
    fn wait_for_propagation(&self, reference: &str, options: &EngineOptions) {
        if !registry::poll(
            self.registry,
            reference,
            options.propagation_timeout,
            PROPAGATION_POLL_PERIOD,
        ) {
            warn!(
                "timed out waiting for image propagation of {reference} after {timeout:?}",
                timeout = options.propagation_timeout
            );
        }
    }
}

/// Strips platform suffixes from version-bearing environment variables so
/// that every per-platform build within one invocation tags with the same
/// version, and returns the canonical version. Mutates the process
/// environment: subprocess builds inherit it. Idempotent and set-once.
pub fn sanitize_version_env() -> Option<String> {
    let mut version = None;

    for key in VERSION_ENV_VARS {
        let Ok(value) = std::env::var(key) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }

        if let Some((base, _)) = value.split_once(PLATFORM_SUFFIX_MARKER) {
            println!("stripping platform suffix from {key}: {value} -> {base}");
            std::env::set_var(key, base);
            if version.is_none() {
                version = Some(base.to_string());
            }
        } else if version.is_none() {
            version = Some(value);
        }
    }

    version
}

fn select_artifacts<'a>(
    artifacts: &'a [Artifact],
    only_artifact: Option<&str>,
) -> Result<Vec<&'a Artifact>> {
    match only_artifact {
        None => Ok(artifacts.iter().collect()),
        Some(name) => match artifacts
            .iter()
            .find(|artifact| artifact.image_name == name)
        {
            Some(artifact) => {
                println!("building single artifact: {name}");
                Ok(vec![artifact])
            }
            None => Err(format!(
                "artifact {name:?} not found in descriptor (available: {names})",
                names = artifacts
                    .iter()
                    .map(|artifact| &artifact.image_name)
                    .join(", ")
            )
            .into()),
        },
    }
}

fn full_tag(image_name: &str, options: &EngineOptions) -> String {
    if let Some(ephemeral) = &options.ephemeral {
        return format!(
            "{EPHEMERAL_REGISTRY_HOST}/{uuid}-{suffix}:{tag}",
            uuid = ephemeral.uuid,
            suffix = ephemeral_suffix(image_name),
            tag = ephemeral.tag
        );
    }

    match options
        .repository
        .as_deref()
        .filter(|repository| !repository.is_empty())
    {
        Some(repository) => format!(
            "{repository}/{image_name}:latest",
            repository = repository.strip_suffix('/').unwrap_or(repository)
        ),
        None => format!("{image_name}:latest"),
    }
}

/// Last hyphen-segment of the image name, used to disambiguate multiple
/// artifacts pushed under one ephemeral UUID. Two artifacts sharing a
/// suffix overwrite each other: last writer wins.
fn ephemeral_suffix(image_name: &str) -> &str {
    let base = match image_name.rfind(':') {
        Some(index) if index > 0 => &image_name[..index],
        _ => image_name,
    };
    let base = base.rsplit('/').next().unwrap_or(base);
    base.rsplit('-').next().unwrap_or("image")
}

fn required_builder(artifact: &Artifact) -> Result<String> {
    artifact.builder.clone().ok_or_else(|| {
        format!(
            "artifact {name} has no buildpack builder",
            name = artifact.image_name
        )
        .into()
    })
}

fn resolve_run_image(
    artifact: &Artifact,
    built_index: &HashMap<String, String>,
) -> Option<String> {
    let run_image = artifact.run_image.as_deref()?;
    match built_index.get(run_image) {
        Some(resolved) => {
            println!("resolving run image {run_image} to built artifact {resolved}");
            Some(resolved.clone())
        }
        None => Some(run_image.to_string()),
    }
}

fn compose_build_env(
    artifact: &Artifact,
    options: &EngineOptions,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut env = BTreeMap::new();
    env.insert(
        "BP_GO_PRIVATE".to_string(),
        std::env::var("BP_GO_PRIVATE").unwrap_or_else(|_| DEFAULT_MODULE_PRIVACY.to_string()),
    );
    for (key, value) in &artifact.env {
        env.insert(key.clone(), value.clone());
    }

    let mut volumes = Vec::new();
    if let Some(ca_path) = &options.ca_path {
        volumes.push(format!("{ca_path}{CA_VOLUME_SUFFIX}"));
        env.insert("SSL_CERT_FILE".to_string(), CA_CONTAINER_PATH.to_string());
    }

    (env, volumes)
}

fn dockerfile_path(artifact: &Artifact, context: &Path) -> PathBuf {
    let dockerfile = artifact.dockerfile_path.as_deref().unwrap_or("Dockerfile");
    if Path::new(dockerfile).is_absolute() {
        PathBuf::from(dockerfile)
    } else {
        context.join(dockerfile)
    }
}

/// Rewrites `localhost:5001` to its loopback address and reports whether
/// the local registry is involved at all, so the caller can mark it
/// insecure for the dispatch.
fn rewrite_loopback(value: &str) -> (String, bool) {
    if value.contains(LOCAL_REGISTRY) {
        (value.replace(LOCAL_REGISTRY, LOOPBACK_REGISTRY), true)
    } else if value.contains(LOOPBACK_REGISTRY) {
        (value.to_string(), true)
    } else {
        (value.to_string(), false)
    }
}
