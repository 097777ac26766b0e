//! Parsing and manipulation of container image references of the form
//! `[registry/]path[:tag][@algorithm:hex]`, following the grammar used by
//! the distribution reference implementation:
//!
//! ```txt
//! reference := name [ ":" tag ] [ "@" digest ]
//! name      := [domain '/'] path-component ['/' path-component]*
//! domain    := domain-component ['.' domain-component]* [':' port-number]
//! tag       := /[\w][\w.-]{0,127}/
//! digest    := algorithm ":" hex, hex at least 32 characters
//! ```
//!
//! A registry is only recognized when the first component contains a `.`
//! or a `:port`, so `myorg/myimage` parses as a bare path.

use std::{fmt, ops::Range, str::FromStr, sync::LazyLock};

use regex::Regex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static REFERENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^
        (?: (?P<registry>
                [a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?
                (?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*
                (?::[0-9]+)?
            ) /
        )?
        (?P<path>
            [a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*
            (?:/[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*)*
        )
        (?: : (?P<tag>[\w][\w.-]{0,127}) )?
        (?: @ (?P<digest>[A-Za-z][A-Za-z0-9]*(?:[+._-][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}) )?
        $
        ",
    )
    .unwrap()
});

/// Error returned when a string does not parse as an image reference.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidImageRef(String);

impl std::error::Error for InvalidImageRef {}

impl fmt::Display for InvalidImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid image reference: {:?}", self.0)
    }
}

/// A parsed, owned image reference.
///
/// Accessors return slices into the original string. The registry section
/// requires a dot or port in its first component so that plain paths like
/// `myorg/myimage` are not mistaken for registry hosts. Only `path` is
/// mandatory.
#[derive(Clone)]
pub struct ImageRef {
    buffer: String,
    registry: Option<Range<usize>>,
    path: Range<usize>,
    tag: Option<Range<usize>>,
    digest: Option<Range<usize>>,
}

impl ImageRef {
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidImageRef> {
        let buffer = value.into();

        let (registry, path, tag, digest) = {
            let Some(captures) = REFERENCE_REGEX.captures(&buffer) else {
                return Err(InvalidImageRef(buffer));
            };
            (
                captures.name("registry").map(|m| m.range()),
                captures.name("path").map(|m| m.range()),
                captures.name("tag").map(|m| m.range()),
                captures.name("digest").map(|m| m.range()),
            )
        };

        let Some(path) = path else {
            return Err(InvalidImageRef(buffer));
        };

        // A registry match without a dot or port is really the first path
        // component (e.g. `myorg/myimage`). The regex cannot express this
        // exception, so it is checked here and the combined section
        // re-validated as a path.
        let (registry, path) = match registry {
            Some(registry_range) => {
                let registry_text = &buffer[registry_range.clone()];
                if registry_text.contains('.') || registry_text.contains(':') {
                    (Some(registry_range), path)
                } else {
                    // The registry grammar allows uppercase, the path
                    // grammar does not.
                    let combined = registry_range.start..path.end;
                    if buffer[combined.clone()]
                        .bytes()
                        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'/'))
                    {
                        (None, combined)
                    } else {
                        return Err(InvalidImageRef(buffer));
                    }
                }
            }
            None => (None, path),
        };

        Ok(Self {
            buffer,
            registry,
            path,
            tag,
            digest,
        })
    }

    /// The `<domain>[:<port>]` section, when present.
    pub fn registry(&self) -> Option<&str> {
        self.registry.clone().map(|range| &self.buffer[range])
    }

    /// The repository path, e.g. `org/app`.
    pub fn path(&self) -> &str {
        &self.buffer[self.path.clone()]
    }

    /// The last component of the repository path, e.g. `app` for `org/app`.
    pub fn name(&self) -> &str {
        let path = self.path();
        path.rsplit('/').next().unwrap_or(path)
    }

    /// The combined `[registry/]path` section without tag or digest.
    pub fn repository(&self) -> &str {
        let start = self.registry.as_ref().map(|r| r.start).unwrap_or(self.path.start);
        &self.buffer[start..self.path.end]
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.clone().map(|range| &self.buffer[range])
    }

    /// The full `<algorithm>:<hex>` digest, when present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.clone().map(|range| &self.buffer[range])
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Returns a reference with the tag replaced (or added), keeping
    /// registry, path, and digest.
    pub fn with_tag(&self, tag: &str) -> Result<ImageRef, InvalidImageRef> {
        let mut buffer = String::with_capacity(self.buffer.len() + tag.len() + 1);
        buffer.push_str(self.repository());
        buffer.push(':');
        buffer.push_str(tag);
        if let Some(digest) = self.digest() {
            buffer.push('@');
            buffer.push_str(digest);
        }
        ImageRef::parse(buffer)
    }

    /// Returns a reference with the digest replaced (or added), keeping
    /// registry, path, and tag.
    pub fn with_digest(&self, digest: &str) -> Result<ImageRef, InvalidImageRef> {
        let mut buffer = String::with_capacity(self.buffer.len() + digest.len() + 1);
        buffer.push_str(self.repository());
        if let Some(tag) = self.tag() {
            buffer.push(':');
            buffer.push_str(tag);
        }
        buffer.push('@');
        buffer.push_str(digest);
        ImageRef::parse(buffer)
    }

    /// Returns the reference without its digest section.
    pub fn without_digest(&self) -> ImageRef {
        match self.digest {
            Some(ref range) => {
                let end = range.start - 1; // drop the '@' separator too
                ImageRef::parse(&self.buffer[..end]).expect("prefix of a valid reference")
            }
            None => self.clone(),
        }
    }
}

impl FromStr for ImageRef {
    type Err = InvalidImageRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageRef::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = InvalidImageRef;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ImageRef::parse(value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.buffer
    }
}

impl std::ops::Deref for ImageRef {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl PartialEq for ImageRef {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
    }
}

impl Eq for ImageRef {}

impl std::hash::Hash for ImageRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.buffer.hash(state);
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.buffer.fmt(f)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buffer)
    }
}

#[cfg(feature = "serde")]
impl Serialize for ImageRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.buffer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        ImageRef::parse(String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_path() {
        let r = ImageRef::parse("org-name/img-name").unwrap();
        assert_eq!(r.registry(), None);
        assert_eq!(r.path(), "org-name/img-name");
        assert_eq!(r.name(), "img-name");
        assert_eq!(r.repository(), "org-name/img-name");
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parses_registry_and_tag() {
        let r = ImageRef::parse("reg.io/org/app:latest").unwrap();
        assert_eq!(r.registry(), Some("reg.io"));
        assert_eq!(r.path(), "org/app");
        assert_eq!(r.repository(), "reg.io/org/app");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parses_registry_with_port() {
        let r = ImageRef::parse("localhost:5001/app:dev").unwrap();
        assert_eq!(r.registry(), Some("localhost:5001"));
        assert_eq!(r.path(), "app");
        assert_eq!(r.tag(), Some("dev"));
    }

    #[test]
    fn parses_tag_and_digest() {
        let r = ImageRef::parse(
            "ghcr.io/x/op:v1.2.3@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        )
        .unwrap();
        assert_eq!(r.registry(), Some("ghcr.io"));
        assert_eq!(r.path(), "x/op");
        assert_eq!(r.tag(), Some("v1.2.3"));
        assert_eq!(
            r.digest(),
            Some("sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn rejects_invalid_references() {
        assert!(ImageRef::parse(".").is_err());
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("a@sha256:1234").is_err()); // digest too short
        assert!(ImageRef::parse("UPPER/case").is_err());
    }

    #[test]
    fn with_tag_replaces_and_keeps_digest() {
        let r = ImageRef::parse(
            "reg.io/org/app:latest@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        )
        .unwrap();
        let retagged = r.with_tag("v1.0.0").unwrap();
        assert_eq!(
            retagged.as_str(),
            "reg.io/org/app:v1.0.0@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn with_digest_appends() {
        let r = ImageRef::parse("reg.io/org/app:latest").unwrap();
        let pinned = r
            .with_digest("sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
            .unwrap();
        assert_eq!(
            pinned.as_str(),
            "reg.io/org/app:latest@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        );
        assert_eq!(pinned.without_digest().as_str(), "reg.io/org/app:latest");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        let r = ImageRef::parse("reg.io/org/app:latest").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#""reg.io/org/app:latest""#);
        assert_eq!(serde_json::from_str::<ImageRef>(&json).unwrap(), r);
    }
}
