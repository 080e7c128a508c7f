//! Image reference parsing
//!
//! Handles Docker-style references:
//! - `ubuntu` → `index.docker.io/library/ubuntu:latest`
//! - `ghcr.io/org/app:v1` → tag form
//! - `ghcr.io/org/app@sha256:...` → digest form
//!
//! Digest form is immutable identity. Tag form is mutable and is resolved to a
//! digest before the core uses it.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_REPO_PREFIX: &str = "library";
const MAX_TAG_LENGTH: usize = 128;

/// Registry host plus repository path, without tag or digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Repository {
    registry: String,
    repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Tag(String),
    Digest(Digest),
}

/// A parsed reference to one artifact: registry, repository and tag or digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    repository: Repository,
    identifier: Identifier,
}

impl Repository {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::Validation("empty repository".to_string()));
        }
        if trimmed.contains('@') {
            return Err(RegistryError::Validation(format!(
                "repository must not contain a digest: {}",
                trimmed
            )));
        }

        let (registry, path) = match trimmed.split_once('/') {
            Some((first, rest)) if is_registry(first) => (normalize_registry(first), rest.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), trimmed.to_string()),
        };

        let path = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{}/{}", OFFICIAL_REPO_PREFIX, path)
        } else {
            path
        };

        validate_repository_path(&path)?;

        Ok(Self {
            registry,
            repository: path,
        })
    }

    /// Registry host, e.g. `ghcr.io` or `localhost:5000`
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path without host, e.g. `org/app`
    pub fn path(&self) -> &str {
        &self.repository
    }

    /// Reference to `tag` inside this repository; fails on an invalid tag
    pub fn tag(&self, tag: &str) -> Result<ImageReference> {
        validate_tag(tag)?;
        Ok(ImageReference {
            repository: self.clone(),
            identifier: Identifier::Tag(tag.to_string()),
        })
    }

    pub fn digest(&self, digest: &Digest) -> ImageReference {
        ImageReference {
            repository: self.clone(),
            identifier: Identifier::Digest(digest.clone()),
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

impl FromStr for Repository {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::Validation("empty reference".to_string()));
        }

        let (name, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (trimmed, None),
        };

        // A tag separator is a ':' after the last '/', so registry ports are kept
        let last_slash = name.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (repo_part, tag) = match name[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                (&name[..split], Some(&name[split + 1..]))
            }
            None => (name, None),
        };

        let repository = Repository::parse(repo_part)?;
        let identifier = match (digest, tag) {
            (Some(digest), _) => Identifier::Digest(digest),
            (None, Some(tag)) => {
                validate_tag(tag)?;
                Identifier::Tag(tag.to_string())
            }
            (None, None) => Identifier::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            repository,
            identifier,
        })
    }

    /// Parse a reference that must be in digest form
    pub fn parse_digest(input: &str) -> Result<Self> {
        let reference = Self::parse(input)?;
        if reference.digest().is_none() {
            return Err(RegistryError::Validation(format!(
                "Expected a digest reference, got: {}",
                input
            )));
        }
        Ok(reference)
    }

    pub fn registry(&self) -> &str {
        self.repository.registry()
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.identifier {
            Identifier::Digest(digest) => Some(digest),
            Identifier::Tag(_) => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.identifier {
            Identifier::Tag(tag) => Some(tag),
            Identifier::Digest(_) => None,
        }
    }

    /// Tag or digest string as used in registry API paths
    pub fn reference_str(&self) -> String {
        match &self.identifier {
            Identifier::Tag(tag) => tag.clone(),
            Identifier::Digest(digest) => digest.to_string(),
        }
    }

    /// Same repository, pointing at `digest`
    pub fn with_digest(&self, digest: &Digest) -> ImageReference {
        self.repository.digest(digest)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Identifier::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Identifier::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// An artifact reference plus the provenance carried alongside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(with = "reference_string")]
    pub reference: ImageReference,
    pub tag: String,
    pub labels: BTreeMap<String, String>,
    /// Reference string as the caller wrote it, before digest resolution
    pub orig_ref: String,
}

impl Metadata {
    pub fn new(reference: ImageReference) -> Self {
        let orig_ref = reference.to_string();
        Self {
            reference,
            tag: String::new(),
            labels: BTreeMap::new(),
            orig_ref,
        }
    }
}

pub(crate) mod reference_string {
    use super::ImageReference;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &ImageReference, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ImageReference, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ImageReference::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// `true` if the string looks like a registry hostname
fn is_registry(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

fn normalize_registry(host: &str) -> String {
    match host {
        "docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

fn validate_repository_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('/').all(|component| {
            !component.is_empty()
                && component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        });
    if valid {
        Ok(())
    } else {
        Err(RegistryError::Validation(format!(
            "Invalid repository name: {}",
            path
        )))
    }
}

/// Tags match `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`
pub fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LENGTH
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::Validation(format!("Invalid tag: {}", tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_simple() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository().path(), "library/ubuntu");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/team/app:v1").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository().path(), "team/app");
        assert_eq!(r.tag(), Some("v1"));
        assert_eq!(r.to_string(), "localhost:5000/team/app:v1");
    }

    #[test]
    fn test_parse_digest() {
        let input = format!("ghcr.io/org/app@{}", DIGEST);
        let r = ImageReference::parse_digest(&input).unwrap();
        assert_eq!(r.digest().unwrap().to_string(), DIGEST);
        assert_eq!(r.to_string(), input);
        assert!(ImageReference::parse_digest("ghcr.io/org/app:v1").is_err());
    }

    #[test]
    fn test_tag_and_digest_prefers_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v1@{}", DIGEST)).unwrap();
        assert!(r.digest().is_some());
        assert_eq!(r.repository().path(), "org/app");
    }

    #[test]
    fn test_invalid_references() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("ghcr.io/Org/app:v1").is_err());
        assert!(ImageReference::parse("ghcr.io/org/app:-bad").is_err());
        assert!(ImageReference::parse("ghcr.io/org/app@sha256:short").is_err());
    }

    #[test]
    fn test_repository_tag_validation() {
        let repo = Repository::parse("registry.example.com/dest/repo").unwrap();
        assert_eq!(
            repo.tag("sha256-abc.imgpkg").unwrap().to_string(),
            "registry.example.com/dest/repo:sha256-abc.imgpkg"
        );
        assert!(repo.tag("-leading").is_err());
        assert!(repo.tag(&"a".repeat(129)).is_err());
        assert!(repo.tag(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_metadata_serde() {
        let mut metadata = Metadata::new(ImageReference::parse("ghcr.io/org/app:v1").unwrap());
        metadata.labels.insert("role".to_string(), "base".to_string());
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"reference\":\"ghcr.io/org/app:v1\""));
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
