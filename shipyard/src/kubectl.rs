use serde::Deserialize;

use crate::{process, Result};

/// Partially implements [Deployment](https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.30/#deployment-v1-apps),
/// just deep enough to reach the pod template's container images.
#[derive(Debug, Deserialize)]
struct Deployment {
    spec: DeploymentSpec,
}

#[derive(Debug, Deserialize)]
struct DeploymentSpec {
    template: PodTemplateSpec,
}

#[derive(Debug, Deserialize)]
struct PodTemplateSpec {
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    image: String,
}

/// Returns the image of the first container in the deployment's pod
/// template, from `kubectl get deployment -o json` output.
fn first_container_image(json: &[u8]) -> Result<String> {
    let deployment: Deployment = serde_json::from_slice(json)?;
    deployment
        .spec
        .template
        .spec
        .containers
        .into_iter()
        .next()
        .map(|container| container.image)
        .ok_or_else(|| "deployment has no containers".into())
}

pub struct Kubectl;

impl Kubectl {
    /// The image the named deployment currently runs, taken from the first
    /// container of the pod template.
    pub fn deployment_image(&self, namespace: &str, name: &str) -> Result<String> {
        let output = process::command!(
            "kubectl",
            "--namespace",
            namespace,
            "get",
            "deployment",
            name,
            "--output=json",
        )
        .output()?;

        first_container_image(&output.stdout)
    }

    /// Blocks until the rollout of the named deployment completes or the
    /// timeout (a kubectl duration such as `30m`) expires.
    pub fn rollout_status(&self, namespace: &str, name: &str, timeout: &str) -> Result<()> {
        process::command!(
            "kubectl",
            "--namespace",
            namespace,
            "rollout",
            "status",
            format!("deployment/{name}"),
            "--timeout",
            timeout,
        )
        .status()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_container_image() {
        let json = br#"{
            "spec": {
                "template": {
                    "spec": {
                        "containers": [
                            {"name": "op", "image": "ghcr.io/x/op:v1.0.0@sha256:aaa"},
                            {"name": "sidecar", "image": "ghcr.io/x/sidecar:latest"}
                        ]
                    }
                }
            }
        }"#;

        assert_eq!(
            first_container_image(json).unwrap(),
            "ghcr.io/x/op:v1.0.0@sha256:aaa"
        );
    }

    #[test]
    fn fails_without_containers() {
        let json = br#"{"spec": {"template": {"spec": {"containers": []}}}}"#;
        assert!(first_container_image(json).is_err());
    }
}
