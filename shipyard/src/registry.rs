use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine as _;
use log::{debug, info};
use oci_distribution::{
    client::{Client, ClientConfig, ClientProtocol},
    manifest::{self, ImageIndexEntry, OciImageIndex, OciManifest, Platform},
    secrets::RegistryAuth,
    Reference,
};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use crate::Result;

/// Layer media types accepted when pulling image content for a copy.
const LAYER_MEDIA_TYPES: &[&str] = &[
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_LAYER_MEDIA_TYPE,
];

/// Manifest media types accepted on fetch: Docker and OCI, image and
/// index.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    manifest::IMAGE_MANIFEST_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    manifest::OCI_IMAGE_MEDIA_TYPE,
    manifest::OCI_IMAGE_INDEX_MEDIA_TYPE,
];

/// What a reference resolves to on the registry side, with enough detail
/// to build a manifest-list entry from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

/// Result of a manifest fetch: an image or an index, discriminated by
/// media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteManifest {
    Image(Descriptor),
    Index(Descriptor),
}

/// Registry operations needed by the engine, promote, and watch. The
/// production implementation is [`RegistryClient`]; tests substitute fakes.
pub trait Registry {
    /// Lightweight existence check returning the manifest digest.
    fn head(&self, reference: &str) -> Result<String>;

    /// Fetches enough of the manifest to discriminate index from image.
    fn get(&self, reference: &str) -> Result<RemoteManifest>;

    /// Publishes a manifest list at the given reference.
    fn write_index(&self, reference: &str, index: &OciImageIndex) -> Result<()>;

    /// Content-preserving copy between references: the destination ends up
    /// with the same digest as the source.
    fn copy(&self, source: &str, destination: &str) -> Result<()>;
}

/// Returns a fresh, empty manifest list. The Docker manifest-list media
/// type is used rather than the OCI index type for broadest registry
/// compatibility.
pub fn manifest_list() -> OciImageIndex {
    OciImageIndex {
        schema_version: 2,
        media_type: Some(manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE.to_string()),
        manifests: Vec::new(),
        annotations: None,
    }
}

/// Appends a per-platform image to a manifest list, carrying the
/// descriptor of the already-pushed image and the platform it was built
/// for (an `os/arch[/variant]` string).
pub fn append_platform_image(
    index: &mut OciImageIndex,
    descriptor: &Descriptor,
    platform: &str,
) {
    let mut parts = platform.splitn(3, '/');
    let os = parts.next().unwrap_or_default().to_string();
    let architecture = parts.next().unwrap_or_default().to_string();
    let variant = parts.next().map(str::to_string);

    index.manifests.push(ImageIndexEntry {
        media_type: descriptor.media_type.clone(),
        digest: descriptor.digest.clone(),
        size: descriptor.size,
        platform: Some(Platform {
            os,
            architecture,
            os_version: None,
            os_features: None,
            variant,
            features: None,
        }),
        annotations: None,
    });
}

/// Digest of the manifest list as it will be stored by the registry:
/// sha256 over the serialized JSON body.
pub fn index_digest(index: &OciImageIndex) -> Result<String> {
    let body = serde_json::to_vec(index)?;
    Ok(format!("sha256:{:x}", Sha256::digest(&body)))
}

/// Polls `reference` via [`Registry::head`] until it resolves or the
/// timeout expires. Returns whether the reference became visible.
pub fn poll(
    registry: &dyn Registry,
    reference: &str,
    timeout: Duration,
    period: Duration,
) -> bool {
    info!("waiting for image propagation: {reference} (timeout: {timeout:?})");
    let start = Instant::now();

    loop {
        match registry.head(reference) {
            Ok(_) => {
                info!("image found: {reference}");
                return true;
            }
            Err(error) => debug!("image {reference} not yet visible: {error}"),
        }

        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(period);
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerConfigAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfig {
    /// Loads the ambient container-credentials file. A missing or
    /// unreadable file means anonymous access everywhere.
    fn load() -> DockerConfig {
        let Some(path) = home::home_dir().map(|home| home.join(".docker/config.json")) else {
            return DockerConfig::default();
        };
        let Ok(data) = std::fs::read(&path) else {
            return DockerConfig::default();
        };
        match serde_json::from_slice(&data) {
            Ok(config) => config,
            Err(error) => {
                debug!("ignoring malformed {path}: {error}", path = path.display());
                DockerConfig::default()
            }
        }
    }

    fn credentials_for(&self, registry: &str) -> RegistryAuth {
        // Docker Hub credentials are stored under the legacy index URL.
        let entry = self.auths.get(registry).or_else(|| {
            (registry == "docker.io" || registry == "registry-1.docker.io")
                .then(|| self.auths.get("https://index.docker.io/v1/"))
                .flatten()
        });

        let Some(entry) = entry else {
            return RegistryAuth::Anonymous;
        };

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return RegistryAuth::Basic(username.clone(), password.clone());
        }

        if let Some(encoded) = &entry.auth {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) {
                if let Ok(text) = String::from_utf8(decoded) {
                    if let Some((username, password)) = text.split_once(':') {
                        return RegistryAuth::Basic(username.to_string(), password.to_string());
                    }
                }
            }
        }

        RegistryAuth::Anonymous
    }
}

/// Production [`Registry`] backed by the OCI distribution client. The
/// client is async; a private current-thread runtime drives it so that the
/// engine itself stays sequential and synchronous.
pub struct RegistryClient {
    runtime: tokio::runtime::Runtime,
    client: Client,
    auths: DockerConfig,
}

impl RegistryClient {
    /// `insecure_registries` entries are host prefixes (e.g.
    /// `localhost:5001`). Matching hosts are contacted over plain HTTP and
    /// self-signed TLS certificates are tolerated.
    pub fn new(insecure_registries: &[String]) -> Result<Self> {
        let insecure_hosts: Vec<String> = insecure_registries
            .iter()
            .map(|entry| entry.split('/').next().unwrap_or(entry).to_string())
            .collect();

        let config = ClientConfig {
            protocol: if insecure_hosts.is_empty() {
                ClientProtocol::Https
            } else {
                ClientProtocol::HttpsExcept(insecure_hosts)
            },
            accept_invalid_certificates: !insecure_registries.is_empty(),
            ..Default::default()
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            client: Client::new(config),
            auths: DockerConfig::load(),
        })
    }

    fn parse_reference(&self, reference: &str) -> Result<Reference> {
        Reference::try_from(reference)
            .map_err(|error| format!("parsing reference {reference:?}: {error}").into())
    }

    fn auth_for(&self, reference: &Reference) -> RegistryAuth {
        self.auths.credentials_for(reference.registry())
    }

    fn copy_image(&self, source: &Reference, destination: &Reference) -> Result<()> {
        let source_auth = self.auth_for(source);
        let destination_auth = self.auth_for(destination);

        let image = self
            .runtime
            .block_on(
                self.client
                    .pull(source, &source_auth, LAYER_MEDIA_TYPES.to_vec()),
            )
            .map_err(|error| format!("pulling {source}: {error}"))?;

        self.runtime
            .block_on(self.client.push(
                destination,
                &image.layers,
                image.config.clone(),
                &destination_auth,
                image.manifest.clone(),
            ))
            .map_err(|error| format!("pushing {destination}: {error}"))?;

        Ok(())
    }
}

impl Registry for RegistryClient {
    fn head(&self, reference: &str) -> Result<String> {
        let reference = self.parse_reference(reference)?;
        let auth = self.auth_for(&reference);
        let digest = self
            .runtime
            .block_on(self.client.fetch_manifest_digest(&reference, &auth))
            .map_err(|error| format!("head {reference}: {error}"))?;
        Ok(digest)
    }

    fn get(&self, reference: &str) -> Result<RemoteManifest> {
        let parsed = self.parse_reference(reference)?;
        let auth = self.auth_for(&parsed);

        let (body, digest) = self
            .runtime
            .block_on(self.client.pull_manifest_raw(
                &parsed,
                &auth,
                MANIFEST_MEDIA_TYPES,
            ))
            .map_err(|error| format!("get {reference}: {error}"))?;

        let descriptor = |media_type: String| Descriptor {
            digest: digest.clone(),
            media_type,
            size: body.len() as i64,
        };

        match serde_json::from_slice::<OciManifest>(&body)
            .map_err(|error| format!("parsing manifest of {reference}: {error}"))?
        {
            OciManifest::Image(image) => Ok(RemoteManifest::Image(descriptor(
                image
                    .media_type
                    .unwrap_or_else(|| manifest::OCI_IMAGE_MEDIA_TYPE.to_string()),
            ))),
            OciManifest::ImageIndex(index) => Ok(RemoteManifest::Index(descriptor(
                index
                    .media_type
                    .unwrap_or_else(|| manifest::OCI_IMAGE_INDEX_MEDIA_TYPE.to_string()),
            ))),
        }
    }

    fn write_index(&self, reference: &str, index: &OciImageIndex) -> Result<()> {
        let parsed = self.parse_reference(reference)?;
        let auth = self.auth_for(&parsed);

        self.runtime
            .block_on(
                self.client
                    .push_manifest_list(&parsed, &auth, index.clone()),
            )
            .map_err(|error| format!("writing manifest list {reference}: {error}"))?;

        Ok(())
    }

    fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let source_ref = self.parse_reference(source)?;
        let destination_ref = self.parse_reference(destination)?;

        match self.get(source)? {
            RemoteManifest::Image(_) => self.copy_image(&source_ref, &destination_ref),
            RemoteManifest::Index(_) => {
                let auth = self.auth_for(&source_ref);
                let (body, _digest) = self
                    .runtime
                    .block_on(self.client.pull_manifest_raw(
                        &source_ref,
                        &auth,
                        MANIFEST_MEDIA_TYPES,
                    ))
                    .map_err(|error| format!("get {source}: {error}"))?;

                let index: OciImageIndex = serde_json::from_slice(&body)
                    .map_err(|error| format!("parsing index of {source}: {error}"))?;

                // Copy each child image by digest, then publish the same
                // index body at the destination.
                let source_repository = reference_repository(&source_ref);
                let destination_repository = reference_repository(&destination_ref);
                for entry in &index.manifests {
                    let child_source = format!("{source_repository}@{digest}", digest = entry.digest);
                    let child_destination =
                        format!("{destination_repository}@{digest}", digest = entry.digest);
                    self.copy_image(
                        &self.parse_reference(&child_source)?,
                        &self.parse_reference(&child_destination)?,
                    )?;
                }

                self.write_index(destination, &index)
            }
        }
    }
}

fn reference_repository(reference: &Reference) -> String {
    format!(
        "{registry}/{repository}",
        registry = reference.registry(),
        repository = reference.repository()
    )
}
