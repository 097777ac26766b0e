use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::{contract::BuildResult, environments, flux, kubectl::Kubectl, Result};

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Deployment (and HelmRelease) name.
    pub component: String,

    pub environment: String,

    pub namespace: String,

    /// Rollout-status timeout, as a kubectl duration such as `30m`.
    pub rollout_timeout: String,

    pub build_result_dir: Option<PathBuf>,

    /// Artifact to watch for; defaults to the last contract entry.
    pub image_name: Option<String>,

    /// Overall budget for the poll loop.
    pub poll_timeout: Duration,

    pub poll_interval: Duration,
}

/// Cluster operations the watch loop needs. The production implementation
/// shells out to flux and kubectl; tests substitute fakes.
pub trait Cluster {
    /// Fire-and-forget reconcile request; failures are ignored.
    fn reconcile(&self, component: &str, namespace: &str);

    fn deployment_image(&self, namespace: &str, component: &str) -> Result<String>;

    fn rollout_status(&self, namespace: &str, component: &str, timeout: &str) -> Result<()>;
}

pub struct KubectlCluster;

impl Cluster for KubectlCluster {
    fn reconcile(&self, component: &str, namespace: &str) {
        flux::reconcile_helmrelease(component, namespace);
    }

    fn deployment_image(&self, namespace: &str, component: &str) -> Result<String> {
        Kubectl.deployment_image(namespace, component)
    }

    fn rollout_status(&self, namespace: &str, component: &str, timeout: &str) -> Result<()> {
        Kubectl.rollout_status(namespace, component, timeout)
    }
}

/// Resolves the environment and runs the watch loop against the real
/// cluster.
pub fn run(options: &WatchOptions) -> Result<()> {
    let destination = environments::watch_destination_repository(&options.environment)
        .ok_or_else(|| {
            format!(
                "could not resolve destination repository for environment {environment:?}; \
                 set the SHIPYARD_IMAGE_*_REPOSITORY variables",
                environment = options.environment
            )
        })?;
    debug!(
        "watching environment {environment} ({destination})",
        environment = options.environment
    );

    watch_deployment(&KubectlCluster, options)
}

/// Polls the deployment until its first container image carries the
/// contracted tag, then waits for the rollout to complete.
pub fn watch_deployment(cluster: &dyn Cluster, options: &WatchOptions) -> Result<()> {
    let contract = BuildResult::read(options.build_result_dir.as_deref())?;
    let full_ref = contract
        .select(options.image_name.as_deref())
        .map_err(|error| format!("selecting image: {error}"))?;
    let version_tag = extract_version_tag(full_ref);

    info!(
        "watching deployment {component} in namespace {namespace}, waiting for image tag {version_tag}",
        component = options.component,
        namespace = options.namespace,
    );

    let deadline = Instant::now() + options.poll_timeout;

    loop {
        cluster.reconcile(&options.component, &options.namespace);

        match cluster.deployment_image(&options.namespace, &options.component) {
            Ok(image) if !image.is_empty() => {
                if image.contains(version_tag) || image.contains(full_ref) {
                    info!(
                        "image matched ({image}), running rollout status (timeout {timeout})",
                        timeout = options.rollout_timeout
                    );
                    cluster
                        .rollout_status(
                            &options.namespace,
                            &options.component,
                            &options.rollout_timeout,
                        )
                        .map_err(|error| format!("rollout failed: {error}"))?;
                    println!("rollout complete");
                    return Ok(());
                }
                debug!("deployment still runs {image}");
            }
            Ok(_) => debug!("deployment reported an empty image"),
            // Transient query errors only shorten the wait for the next
            // poll; the deadline is authoritative.
            Err(error) => debug!("querying deployment image: {error}"),
        }

        if Instant::now() >= deadline {
            return Err(format!(
                "timed out ({timeout:?}) waiting for deployment {component} to use tag {version_tag}",
                timeout = options.poll_timeout,
                component = options.component,
            )
            .into());
        }
        std::thread::sleep(options.poll_interval);
    }
}

/// The version portion of a fully-qualified image reference:
///
/// ```txt
/// ghcr.io/org/image:v1.0.0@sha256:abc -> v1.0.0
/// ghcr.io/org/image:v1.0.0            -> v1.0.0
/// image:v1.0.0                        -> v1.0.0
/// ```
///
/// Falls back to the input unchanged when no tag separator is present.
fn extract_version_tag(full_ref: &str) -> &str {
    let without_digest = match full_ref.find('@') {
        Some(index) => &full_ref[..index],
        None => full_ref,
    };
    match without_digest.rfind(':') {
        Some(index) => &without_digest[index + 1..],
        None => full_ref,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::contract::{BuildEntry, BUILD_RESULT_FILENAME};

    struct FakeCluster {
        images: RefCell<VecDeque<Result<String, String>>>,
        reconciles: RefCell<u32>,
        rollouts: RefCell<u32>,
    }

    impl FakeCluster {
        fn new(images: Vec<Result<String, String>>) -> Self {
            Self {
                images: RefCell::new(images.into_iter().collect()),
                reconciles: RefCell::new(0),
                rollouts: RefCell::new(0),
            }
        }
    }

    impl Cluster for FakeCluster {
        fn reconcile(&self, _component: &str, _namespace: &str) {
            *self.reconciles.borrow_mut() += 1;
        }

        fn deployment_image(&self, _namespace: &str, _component: &str) -> crate::Result<String> {
            match self.images.borrow_mut().pop_front() {
                Some(Ok(image)) => Ok(image),
                Some(Err(error)) => Err(error.into()),
                None => Ok(String::new()),
            }
        }

        fn rollout_status(
            &self,
            _namespace: &str,
            _component: &str,
            _timeout: &str,
        ) -> crate::Result<()> {
            *self.rollouts.borrow_mut() += 1;
            Ok(())
        }
    }

    fn write_contract(dir: &std::path::Path, tag: &str) {
        let contract = BuildResult {
            builds: vec![BuildEntry {
                image_name: "op".to_string(),
                tag: tag.to_string(),
            }],
        };
        std::fs::write(
            dir.join(BUILD_RESULT_FILENAME),
            serde_json::to_vec(&contract).unwrap(),
        )
        .unwrap();
    }

    fn options(dir: &std::path::Path, poll_timeout: Duration) -> WatchOptions {
        WatchOptions {
            component: "op".to_string(),
            environment: "prod".to_string(),
            namespace: "default".to_string(),
            rollout_timeout: "30m".to_string(),
            build_result_dir: Some(dir.to_path_buf()),
            image_name: None,
            poll_timeout,
            poll_interval: Duration::ZERO,
        }
    }

    #[test]
    fn polls_until_image_matches_then_rolls_out_once() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "ghcr.io/x/op:v1.2.3@sha256:bbb");

        let cluster = FakeCluster::new(vec![
            Ok("ghcr.io/x/op:v1.0.0@sha256:aaa".to_string()),
            Err("transient apiserver error".to_string()),
            Ok("ghcr.io/x/op:v1.2.3@sha256:bbb".to_string()),
        ]);

        watch_deployment(&cluster, &options(dir.path(), Duration::from_secs(60))).unwrap();

        assert_eq!(*cluster.rollouts.borrow(), 1);
        assert_eq!(*cluster.reconciles.borrow(), 3);
    }

    #[test]
    fn times_out_with_expected_tag_in_message() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "ghcr.io/x/op:v1.2.3@sha256:bbb");

        let cluster = FakeCluster::new(vec![Ok("ghcr.io/x/op:v1.0.0@sha256:aaa".to_string())]);

        let error = watch_deployment(&cluster, &options(dir.path(), Duration::ZERO))
            .unwrap_err()
            .to_string();

        assert!(error.contains("v1.2.3"), "{error}");
        assert!(error.contains("op"), "{error}");
        assert_eq!(*cluster.rollouts.borrow(), 0);
    }

    #[test]
    fn missing_contract_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::new(vec![]);
        assert!(watch_deployment(&cluster, &options(dir.path(), Duration::ZERO)).is_err());
    }

    #[test]
    fn selects_artifact_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let contract = BuildResult {
            builds: vec![
                BuildEntry {
                    image_name: "base".to_string(),
                    tag: "ghcr.io/x/base:v2@sha256:aaa".to_string(),
                },
                BuildEntry {
                    image_name: "op".to_string(),
                    tag: "ghcr.io/x/op:v1.2.3@sha256:bbb".to_string(),
                },
            ],
        };
        std::fs::write(
            dir.path().join(BUILD_RESULT_FILENAME),
            serde_json::to_vec(&contract).unwrap(),
        )
        .unwrap();

        let cluster = FakeCluster::new(vec![Ok("ghcr.io/x/base:v2@sha256:aaa".to_string())]);
        let watch_options = WatchOptions {
            image_name: Some("base".to_string()),
            ..options(dir.path(), Duration::from_secs(60))
        };

        watch_deployment(&cluster, &watch_options).unwrap();
        assert_eq!(*cluster.rollouts.borrow(), 1);
    }

    #[test]
    fn version_tag_extraction() {
        assert_eq!(extract_version_tag("ghcr.io/org/image:v1.0.0@sha256:abc"), "v1.0.0");
        assert_eq!(extract_version_tag("ghcr.io/org/image:v1.0.0"), "v1.0.0");
        assert_eq!(extract_version_tag("image:v1.0.0"), "v1.0.0");
        assert_eq!(extract_version_tag("image"), "image");
    }
}
