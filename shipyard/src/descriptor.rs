use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use itertools::Itertools;
use serde::Deserialize;

use crate::Result;

/// How an artifact is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Cloud Native Buildpacks lifecycle.
    Buildpack,
    /// Buildpack variant whose output is a Helm OCI artifact. Inferred
    /// from the `-chart` image name suffix.
    Chart,
    /// Dockerfile build through the container runtime.
    ContainerBuild,
}

/// One declared image in the build descriptor, validated and ready for the
/// engine.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Symbolic name; also the path component appended to the target
    /// repository when forming the full tag.
    pub image_name: String,

    /// Source-tree subdirectory.
    pub workspace: String,

    pub kind: ArtifactKind,

    /// Builder image reference, for buildpack and chart artifacts.
    pub builder: Option<String>,

    /// Run image: either a literal reference or the symbolic name of
    /// another artifact built earlier in the same invocation.
    pub run_image: Option<String>,

    /// Build-time environment, parsed from `K=V` entries.
    pub env: BTreeMap<String, String>,

    /// Dockerfile path for container builds, relative to the workspace
    /// unless absolute.
    pub dockerfile_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    build: RawBuild,
}

#[derive(Debug, Deserialize)]
struct RawBuild {
    #[serde(default)]
    artifacts: Vec<RawArtifact>,
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    image: String,

    #[serde(default)]
    context: Option<String>,

    #[serde(default)]
    buildpacks: Option<RawBuildpacks>,

    #[serde(default)]
    docker: Option<RawDocker>,
}

#[derive(Debug, Deserialize)]
struct RawBuildpacks {
    builder: String,

    #[serde(default, rename = "runImage")]
    run_image: Option<String>,

    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocker {
    #[serde(default)]
    dockerfile: Option<String>,
}

/// Loads the build descriptor and returns its artifacts in topological
/// order: every artifact whose `run_image` names another artifact appears
/// after that artifact. Ties preserve the declared order.
pub fn load(path: &Path) -> Result<Vec<Artifact>> {
    let data = std::fs::read_to_string(path)
        .map_err(|error| format!("reading descriptor {path}: {error}", path = path.display()))?;

    let raw: RawDescriptor = serde_yaml::from_str(&data)
        .map_err(|error| format!("parsing descriptor {path}: {error}", path = path.display()))?;

    let artifacts = raw
        .build
        .artifacts
        .into_iter()
        .map(validate)
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    for artifact in &artifacts {
        if !seen.insert(artifact.image_name.as_str()) {
            return Err(format!(
                "duplicate artifact image name {name:?} in descriptor",
                name = artifact.image_name
            )
            .into());
        }
    }

    sort_by_dependency(artifacts)
}

fn validate(raw: RawArtifact) -> Result<Artifact> {
    let RawArtifact {
        image,
        context,
        buildpacks,
        docker,
    } = raw;

    match (buildpacks, docker) {
        (Some(buildpacks), None) => {
            let kind = if image.ends_with("-chart") {
                ArtifactKind::Chart
            } else {
                ArtifactKind::Buildpack
            };
            Ok(Artifact {
                workspace: context.unwrap_or_default(),
                kind,
                builder: Some(buildpacks.builder),
                run_image: buildpacks.run_image,
                env: parse_env(&image, buildpacks.env)?,
                dockerfile_path: None,
                image_name: image,
            })
        }
        (None, Some(docker)) => Ok(Artifact {
            workspace: context.unwrap_or_default(),
            kind: ArtifactKind::ContainerBuild,
            builder: None,
            run_image: None,
            env: BTreeMap::new(),
            dockerfile_path: Some(docker.dockerfile.unwrap_or_else(|| "Dockerfile".to_string())),
            image_name: image,
        }),
        (Some(_), Some(_)) => {
            Err(format!("artifact {image:?} declares both buildpacks and docker").into())
        }
        (None, None) => {
            Err(format!("artifact {image:?} declares neither buildpacks nor docker").into())
        }
    }
}

fn parse_env(image: &str, entries: Vec<String>) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => {
                return Err(format!(
                    "artifact {image:?}: env entry {entry:?} is not of the form KEY=VALUE"
                )
                .into())
            }
        }
    }
    Ok(env)
}

/// Stable topological sort over the `run_image -> image_name` edges. A
/// `run_image` value equal to some artifact's `image_name` is a symbolic
/// dependency; anything else is a literal reference and carries no edge.
fn sort_by_dependency(artifacts: Vec<Artifact>) -> Result<Vec<Artifact>> {
    let index_by_name: HashMap<&str, usize> = artifacts
        .iter()
        .enumerate()
        .map(|(index, artifact)| (artifact.image_name.as_str(), index))
        .collect();

    let dependency: Vec<Option<usize>> = artifacts
        .iter()
        .map(|artifact| {
            artifact
                .run_image
                .as_deref()
                .and_then(|run_image| index_by_name.get(run_image).copied())
        })
        .collect();

    let mut placed = vec![false; artifacts.len()];
    let mut order = Vec::with_capacity(artifacts.len());

    // Kahn's algorithm specialized for at most one dependency per node,
    // always picking the earliest declared ready artifact so that
    // independent artifacts keep their descriptor order.
    while order.len() < artifacts.len() {
        let next = (0..artifacts.len()).find(|&index| {
            !placed[index]
                && match dependency[index] {
                    Some(dep) => placed[dep],
                    None => true,
                }
        });

        match next {
            Some(index) => {
                placed[index] = true;
                order.push(index);
            }
            None => {
                let remaining = artifacts
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !placed[*index])
                    .map(|(_, artifact)| &artifact.image_name)
                    .join(", ");
                return Err(format!(
                    "cyclic runImage dependency between artifacts: {remaining}"
                )
                .into());
            }
        }
    }

    let mut by_index: Vec<Option<Artifact>> = artifacts.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|index| by_index[index].take().expect("each index placed once"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_descriptor(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_buildpack_and_docker_artifacts() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: base
      context: images/base
      buildpacks:
        builder: builders/tiny
        env:
          - "A=1"
          - "B=two"
    - image: app
      context: services/app
      docker:
        dockerfile: build/Dockerfile
"#,
        );

        let artifacts = load(&path).unwrap();
        assert_eq!(artifacts.len(), 2);

        assert_eq!(artifacts[0].image_name, "base");
        assert_eq!(artifacts[0].kind, ArtifactKind::Buildpack);
        assert_eq!(artifacts[0].workspace, "images/base");
        assert_eq!(artifacts[0].builder.as_deref(), Some("builders/tiny"));
        assert_eq!(artifacts[0].env.get("A").map(String::as_str), Some("1"));
        assert_eq!(artifacts[0].env.get("B").map(String::as_str), Some("two"));

        assert_eq!(artifacts[1].image_name, "app");
        assert_eq!(artifacts[1].kind, ArtifactKind::ContainerBuild);
        assert_eq!(artifacts[1].dockerfile_path.as_deref(), Some("build/Dockerfile"));
    }

    #[test]
    fn infers_chart_kind_from_name_suffix() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: monitor-chart
      context: chart
      buildpacks:
        builder: builders/helm
"#,
        );

        let artifacts = load(&path).unwrap();
        assert_eq!(artifacts[0].kind, ArtifactKind::Chart);
    }

    #[test]
    fn dockerfile_defaults_when_omitted() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: app
      docker: {}
"#,
        );

        let artifacts = load(&path).unwrap();
        assert_eq!(artifacts[0].dockerfile_path.as_deref(), Some("Dockerfile"));
    }

    #[test]
    fn orders_dependent_artifact_after_its_run_image() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: app
      context: app
      buildpacks:
        builder: builders/tiny
        runImage: base
    - image: base
      context: base
      buildpacks:
        builder: builders/tiny
"#,
        );

        let artifacts = load(&path).unwrap();
        let names: Vec<&str> = artifacts.iter().map(|a| a.image_name.as_str()).collect();
        assert_eq!(names, ["base", "app"]);
    }

    #[test]
    fn literal_run_image_carries_no_edge() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: app
      context: app
      buildpacks:
        builder: builders/tiny
        runImage: docker.io/library/debian:stable-slim
    - image: other
      context: other
      buildpacks:
        builder: builders/tiny
"#,
        );

        let artifacts = load(&path).unwrap();
        let names: Vec<&str> = artifacts.iter().map(|a| a.image_name.as_str()).collect();
        assert_eq!(names, ["app", "other"]);
        assert_eq!(
            artifacts[0].run_image.as_deref(),
            Some("docker.io/library/debian:stable-slim")
        );
    }

    #[test]
    fn rejects_duplicate_image_names() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: app
      docker: {}
    - image: app
      docker: {}
"#,
        );

        let error = load(&path).unwrap_err().to_string();
        assert!(error.contains("duplicate artifact image name"), "{error}");
    }

    #[test]
    fn rejects_run_image_cycle() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: a
      buildpacks:
        builder: builders/tiny
        runImage: b
    - image: b
      buildpacks:
        builder: builders/tiny
        runImage: a
"#,
        );

        let error = load(&path).unwrap_err().to_string();
        assert!(error.contains("cyclic runImage dependency"), "{error}");
    }

    #[test]
    fn rejects_artifact_without_build_section() {
        let (_dir, path) = write_descriptor(
            r#"
build:
  artifacts:
    - image: app
"#,
        );

        let error = load(&path).unwrap_err().to_string();
        assert!(error.contains("neither buildpacks nor docker"), "{error}");
    }

    #[test]
    fn rejects_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.yaml")).is_err());
    }
}
