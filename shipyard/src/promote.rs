use std::path::PathBuf;

use image_ref::ImageRef;

use crate::{contract::BuildResult, environments, registry::Registry, Result};

#[derive(Debug, Clone)]
pub struct PromoteOptions {
    pub source_environment: String,
    pub destination_environment: String,
    pub build_result_dir: Option<PathBuf>,

    /// Artifact to promote; defaults to the last contract entry.
    pub image_name: Option<String>,
}

/// Copies the selected artifact from the source environment's repository
/// to the destination environment's repository. The copy is
/// content-preserving: the destination carries the same digest as the
/// source, so the artifact moves through environments unchanged.
pub fn promote(registry: &dyn Registry, options: &PromoteOptions) -> Result<()> {
    let (source, destination) = environments::promote_repositories(
        &options.source_environment,
        &options.destination_environment,
    );
    let source = source.ok_or_else(|| {
        format!(
            "could not resolve source repository for environment {environment:?}; \
             set the SHIPYARD_IMAGE_*_REPOSITORY variables",
            environment = options.source_environment
        )
    })?;
    let destination = destination.ok_or_else(|| {
        format!(
            "could not resolve destination repository for environment {environment:?}; \
             set the SHIPYARD_IMAGE_*_REPOSITORY variables",
            environment = options.destination_environment
        )
    })?;

    promote_between(
        registry,
        &source,
        &destination,
        options.build_result_dir.as_deref(),
        options.image_name.as_deref(),
    )
}

pub(crate) fn promote_between(
    registry: &dyn Registry,
    source_repository: &str,
    destination_repository: &str,
    build_result_dir: Option<&std::path::Path>,
    image_name: Option<&str>,
) -> Result<()> {
    let contract = BuildResult::read(build_result_dir)?;
    let stored = contract.select(image_name)?;

    let destination = rewrite_repository(stored, source_repository, destination_repository)?;

    println!("promoting {stored} -> {destination}");
    registry
        .copy(stored, &destination)
        .map_err(|error| format!("promotion failed: {error}"))?;
    println!("promotion successful");

    Ok(())
}

/// Re-homes a stored reference under the destination repository,
/// preserving everything after the source repository prefix. When the
/// reference does not start with the known source repository, the image
/// name, tag, and digest are kept and re-prefixed.
fn rewrite_repository(
    stored: &str,
    source_repository: &str,
    destination_repository: &str,
) -> Result<String> {
    let source_prefix = format!(
        "{repository}/",
        repository = source_repository.trim_end_matches('/')
    );
    let destination_repository = destination_repository.trim_end_matches('/');

    if let Some(suffix) = stored.strip_prefix(&source_prefix) {
        return Ok(format!("{destination_repository}/{suffix}"));
    }

    let parsed = ImageRef::parse(stored)
        .map_err(|error| format!("contract reference {stored:?}: {error}"))?;

    let mut destination = format!(
        "{destination_repository}/{name}",
        name = parsed.name()
    );
    if let Some(tag) = parsed.tag() {
        destination.push(':');
        destination.push_str(tag);
    }
    if let Some(digest) = parsed.digest() {
        destination.push('@');
        destination.push_str(digest);
    }
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use oci_distribution::manifest::OciImageIndex;

    use super::*;
    use crate::contract::{BuildEntry, BUILD_RESULT_FILENAME};
    use crate::registry::RemoteManifest;

    #[derive(Default)]
    struct FakeRegistry {
        copies: RefCell<Vec<(String, String)>>,
    }

    impl Registry for FakeRegistry {
        fn head(&self, _reference: &str) -> crate::Result<String> {
            Err("not used by promote".into())
        }

        fn get(&self, _reference: &str) -> crate::Result<RemoteManifest> {
            Err("not used by promote".into())
        }

        fn write_index(&self, _reference: &str, _index: &OciImageIndex) -> crate::Result<()> {
            Err("not used by promote".into())
        }

        fn copy(&self, source: &str, destination: &str) -> crate::Result<()> {
            self.copies
                .borrow_mut()
                .push((source.to_string(), destination.to_string()));
            Ok(())
        }
    }

    fn write_contract(dir: &std::path::Path) {
        let contract = BuildResult {
            builds: vec![
                BuildEntry {
                    image_name: "base".to_string(),
                    tag: "ghcr.io/dev/base:v1@sha256:def".to_string(),
                },
                BuildEntry {
                    image_name: "app".to_string(),
                    tag: "ghcr.io/dev/app:v1@sha256:abc".to_string(),
                },
            ],
        };
        std::fs::write(
            dir.join(BUILD_RESULT_FILENAME),
            serde_json::to_vec(&contract).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn promotes_selected_artifact_preserving_tag_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path());
        let registry = FakeRegistry::default();

        promote_between(
            &registry,
            "ghcr.io/dev",
            "eu.gcr.io/project/pp",
            Some(dir.path()),
            Some("app"),
        )
        .unwrap();

        assert_eq!(
            registry.copies.borrow().as_slice(),
            [(
                "ghcr.io/dev/app:v1@sha256:abc".to_string(),
                "eu.gcr.io/project/pp/app:v1@sha256:abc".to_string()
            )]
        );
    }

    #[test]
    fn defaults_to_last_contract_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path());
        let registry = FakeRegistry::default();

        promote_between(
            &registry,
            "ghcr.io/dev",
            "eu.gcr.io/project/pp",
            Some(dir.path()),
            None,
        )
        .unwrap();

        assert_eq!(registry.copies.borrow()[0].0, "ghcr.io/dev/app:v1@sha256:abc");
    }

    #[test]
    fn missing_contract_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FakeRegistry::default();

        assert!(promote_between(
            &registry,
            "ghcr.io/dev",
            "eu.gcr.io/project/pp",
            Some(dir.path()),
            None,
        )
        .is_err());
        assert!(registry.copies.borrow().is_empty());
    }

    #[test]
    fn rewrite_strips_known_source_prefix() {
        assert_eq!(
            rewrite_repository("ghcr.io/dev/app:v1@sha256:abc", "ghcr.io/dev", "eu.gcr.io/pp")
                .unwrap(),
            "eu.gcr.io/pp/app:v1@sha256:abc"
        );
    }

    #[test]
    fn rewrite_falls_back_to_reference_components() {
        let digest =
            "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(
            rewrite_repository(
                &format!("other.io/somewhere/app:v1@{digest}"),
                "ghcr.io/dev",
                "eu.gcr.io/pp"
            )
            .unwrap(),
            format!("eu.gcr.io/pp/app:v1@{digest}")
        );
    }
}
