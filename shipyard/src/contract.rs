use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::Result;

pub const BUILD_RESULT_FILENAME: &str = "build_result.json";

/// A single artifact record in `build_result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEntry {
    #[serde(rename = "imageName")]
    pub image_name: String,

    /// Fully-qualified reference: `registry/image:tag@sha256:digest`.
    pub tag: String,
}

/// The contract written by `shipyard build --push` and consumed by
/// `promote-image` and `watch-deployment`. Entries appear in build order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub builds: Vec<BuildEntry>,
}

impl BuildResult {
    /// Reads `build_result.json` from the given directory, or the current
    /// working directory when `dir` is `None`. An existing file with an
    /// empty `builds` list is an error: the contract is only ever written
    /// complete.
    pub fn read(dir: Option<&Path>) -> Result<BuildResult> {
        let path = match dir {
            Some(dir) => dir.join(BUILD_RESULT_FILENAME),
            None => PathBuf::from(BUILD_RESULT_FILENAME),
        };
        let data = std::fs::read(&path)
            .map_err(|error| format!("reading {path}: {error}", path = path.display()))?;

        let result: BuildResult = serde_json::from_slice(&data)
            .map_err(|error| format!("parsing {path}: {error}", path = path.display()))?;

        if result.builds.is_empty() {
            return Err(format!("{path}: no builds found", path = path.display()).into());
        }

        Ok(result)
    }

    /// Writes the contract to `build_result.json` in the given directory.
    /// A contract with zero entries is not written at all.
    pub fn write(&self, dir: &Path) -> Result<()> {
        if self.builds.is_empty() {
            return Ok(());
        }

        let path = dir.join(BUILD_RESULT_FILENAME);
        let data = serde_json::to_vec(self)?;
        std::fs::write(&path, data)
            .map_err(|error| format!("writing {path}: {error}", path = path.display()))?;
        Ok(())
    }

    /// The first entry's tag. Kept for callers that predate multi-artifact
    /// contracts; prefer [`BuildResult::select`].
    #[allow(dead_code)]
    pub fn first_tag(&self) -> Result<&str> {
        match self.builds.first() {
            Some(entry) => Ok(&entry.tag),
            None => Err("no builds found".into()),
        }
    }

    /// The tag recorded for the named artifact, or an error enumerating the
    /// available names.
    pub fn tag_for_image(&self, image_name: &str) -> Result<&str> {
        match self
            .builds
            .iter()
            .find(|entry| entry.image_name == image_name)
        {
            Some(entry) => Ok(&entry.tag),
            None => Err(format!(
                "image {image_name:?} not found in {BUILD_RESULT_FILENAME} (available: {names})",
                names = self.builds.iter().map(|entry| &entry.image_name).join(", "),
            )
            .into()),
        }
    }

    /// Selects the tag for `image_name` when given, otherwise the last
    /// entry. Base images precede application images in the descriptor, so
    /// the last entry is the application image.
    pub fn select(&self, image_name: Option<&str>) -> Result<&str> {
        match image_name {
            Some(name) => self.tag_for_image(name),
            None => match self.builds.last() {
                Some(entry) => Ok(&entry.tag),
                None => Err("no builds found".into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BuildResult {
        BuildResult {
            builds: vec![
                BuildEntry {
                    image_name: "base".to_string(),
                    tag: "ghcr.io/x/base:latest@sha256:aaa".to_string(),
                },
                BuildEntry {
                    image_name: "app".to_string(),
                    tag: "ghcr.io/x/app:latest@sha256:bbb".to_string(),
                },
            ],
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let result = sample();
        result.write(dir.path()).unwrap();

        let read = BuildResult::read(Some(dir.path())).unwrap();
        assert_eq!(read, result);
    }

    #[test]
    fn empty_contract_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        BuildResult::default().write(dir.path()).unwrap();
        assert!(!dir.path().join(BUILD_RESULT_FILENAME).exists());
    }

    #[test]
    fn read_rejects_empty_builds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BUILD_RESULT_FILENAME), r#"{"builds":[]}"#).unwrap();
        assert!(BuildResult::read(Some(dir.path())).is_err());
    }

    #[test]
    fn read_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BuildResult::read(Some(dir.path())).is_err());
    }

    #[test]
    fn serializes_with_camel_case_image_name() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains(r#""imageName":"base""#));
        assert!(json.contains(r#""tag":"ghcr.io/x/base:latest@sha256:aaa""#));
    }

    #[test]
    fn first_tag_returns_first_entry() {
        assert_eq!(sample().first_tag().unwrap(), "ghcr.io/x/base:latest@sha256:aaa");
    }

    #[test]
    fn tag_for_image_finds_exact_match() {
        let result = sample();
        assert_eq!(
            result.tag_for_image("app").unwrap(),
            "ghcr.io/x/app:latest@sha256:bbb"
        );
        let error = result.tag_for_image("missing").unwrap_err().to_string();
        assert!(error.contains("base, app"), "unexpected error: {error}");
    }

    #[test]
    fn select_defaults_to_last_entry() {
        let result = sample();
        assert_eq!(result.select(None).unwrap(), "ghcr.io/x/app:latest@sha256:bbb");
        assert_eq!(
            result.select(Some("base")).unwrap(),
            "ghcr.io/x/base:latest@sha256:aaa"
        );
    }
}
