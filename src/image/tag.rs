//! Upload tag derivation
//!
//! Some registries refuse manifest uploads addressed by digest, so every artifact
//! is written under a tag computed from its digest. Both generators are pure:
//! the same input always yields the same tag.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::reference::{ImageReference, Repository};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const TAG_SUFFIX: &str = ".imgpkg";
/// Longest repository-derived prefix kept in a repo-based tag
pub const MAX_PREFIX_LENGTH: usize = 49;

/// A resolved digest reference paired with the reference it was resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestWrap {
    digest_ref: ImageReference,
    orig_ref: String,
}

impl DigestWrap {
    pub fn new(digest_ref: ImageReference, orig_ref: impl Into<String>) -> Result<Self> {
        if digest_ref.digest().is_none() {
            return Err(RegistryError::Validation(format!(
                "Expected a digest reference, got: {}",
                digest_ref
            )));
        }
        Ok(Self {
            digest_ref,
            orig_ref: orig_ref.into(),
        })
    }

    pub fn parse(digest_ref: &str, orig_ref: &str) -> Result<Self> {
        Self::new(ImageReference::parse_digest(digest_ref)?, orig_ref)
    }

    pub fn digest_ref(&self) -> &ImageReference {
        &self.digest_ref
    }

    pub fn orig_ref(&self) -> &str {
        &self.orig_ref
    }

    pub fn digest(&self) -> Result<&Digest> {
        self.digest_ref.digest().ok_or_else(|| {
            RegistryError::Internal(format!("{} lost its digest", self.digest_ref))
        })
    }
}

pub trait TagGenerator: Send + Sync + fmt::Debug {
    /// Tag reference in `destination` under which `item` is uploaded
    fn generate_tag(&self, item: &DigestWrap, destination: &Repository) -> Result<ImageReference>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagStrategy {
    #[default]
    Default,
    RepoBased,
}

impl TagStrategy {
    pub fn generator(self) -> Arc<dyn TagGenerator> {
        match self {
            TagStrategy::Default => Arc::new(DefaultTagGenerator),
            TagStrategy::RepoBased => Arc::new(RepoBasedTagGenerator),
        }
    }
}

/// `{algorithm}-{hex}.imgpkg`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTagGenerator;

impl TagGenerator for DefaultTagGenerator {
    fn generate_tag(&self, item: &DigestWrap, destination: &Repository) -> Result<ImageReference> {
        let digest = item.digest()?;
        destination.tag(&format!("{}-{}{}", digest.algorithm(), digest.hex(), TAG_SUFFIX))
    }
}

/// `{repo-path-prefix}-{algorithm}-{hex}.imgpkg`, keeping a readable hint of
/// where the artifact came from
#[derive(Debug, Clone, Copy, Default)]
pub struct RepoBasedTagGenerator;

impl TagGenerator for RepoBasedTagGenerator {
    fn generate_tag(&self, item: &DigestWrap, destination: &Repository) -> Result<ImageReference> {
        let digest = item.digest()?;
        let source = if item.orig_ref().is_empty() {
            item.digest_ref().clone()
        } else {
            ImageReference::parse(item.orig_ref())?
        };

        let prefix = tag_prefix(source.repository().path());
        let mut tag = format!(
            "{}-{}-{}{}",
            prefix,
            digest.algorithm(),
            digest.hex(),
            TAG_SUFFIX
        );
        if tag.starts_with('-') {
            tag.remove(0);
        }
        let tag = tag.replace(':', "-");

        destination.tag(&tag)
    }
}

/// Join repository path segments with `-`, drop characters a tag cannot hold
/// and keep at most the last [`MAX_PREFIX_LENGTH`] characters.
///
/// Only the leading run before truncation is trimmed. A prefix that truncation
/// leaves starting with `-` loses exactly that one character in the final tag;
/// anything else a tag cannot start with makes tag generation fail.
fn tag_prefix(repository_path: &str) -> String {
    let joined = repository_path.split('/').collect::<Vec<_>>().join("-");
    let cleaned: String = joined
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "._-".contains(*c))
        .collect();

    if cleaned.len() > MAX_PREFIX_LENGTH {
        cleaned[cleaned.len() - MAX_PREFIX_LENGTH..].to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn wrap(orig_ref: &str) -> DigestWrap {
        DigestWrap::parse(&format!("source.example.com/team/app@sha256:{}", HEX), orig_ref).unwrap()
    }

    fn destination() -> Repository {
        Repository::parse("registry.example.com/dest/bundle").unwrap()
    }

    #[test]
    fn test_default_tag() {
        let tag = DefaultTagGenerator
            .generate_tag(&wrap("source.example.com/team/app:v1"), &destination())
            .unwrap();
        assert_eq!(tag.tag().unwrap(), format!("sha256-{}.imgpkg", HEX));
        assert_eq!(tag.repository(), &destination());
    }

    #[test]
    fn test_repo_based_tag() {
        let tag = RepoBasedTagGenerator
            .generate_tag(&wrap("source.example.com/team/app:v1"), &destination())
            .unwrap();
        assert_eq!(tag.tag().unwrap(), format!("team-app-sha256-{}.imgpkg", HEX));
    }

    #[test]
    fn test_repo_based_tag_truncates_long_paths() {
        let long_path = format!("source.example.com/{}/final-segment:v1", "nested".repeat(20));
        let tag = RepoBasedTagGenerator
            .generate_tag(&wrap(&long_path), &destination())
            .unwrap();
        let tag = tag.tag().unwrap();
        let suffix = format!("-sha256-{}.imgpkg", HEX);
        assert!(tag.starts_with("ested"));
        assert!(tag.contains("-final-segment-sha256-"));
        assert_eq!(tag.len(), MAX_PREFIX_LENGTH + suffix.len());
        assert!(!tag.starts_with('-'));
        assert!(tag.ends_with(&suffix));
    }

    #[test]
    fn test_repo_based_tag_uses_digest_ref_without_origin() {
        let tag = RepoBasedTagGenerator.generate_tag(&wrap(""), &destination()).unwrap();
        assert_eq!(tag.tag().unwrap(), format!("team-app-sha256-{}.imgpkg", HEX));
    }

    #[test]
    fn test_repo_based_tag_is_pure() {
        let item = wrap("source.example.com/team/app:v1");
        let first = RepoBasedTagGenerator.generate_tag(&item, &destination()).unwrap();
        for _ in 0..5 {
            assert_eq!(RepoBasedTagGenerator.generate_tag(&item, &destination()).unwrap(), first);
        }
    }

    #[test]
    fn test_tag_prefix_cleaning() {
        assert_eq!(tag_prefix("team/app"), "team-app");
        assert_eq!(tag_prefix("__team/app"), "team-app");
        assert_eq!(tag_prefix("team/a+p~p"), "team-app");

        // Truncation may leave a leading separator; it is not trimmed again
        let long = "a.".repeat(40);
        let prefix = tag_prefix(&long);
        assert_eq!(prefix.len(), MAX_PREFIX_LENGTH);
        assert!(prefix.starts_with('.'));

        let dashes = format!("{}--{}", "p".repeat(10), "y".repeat(47));
        assert_eq!(tag_prefix(&dashes), format!("--{}", "y".repeat(47)));
    }

    #[test]
    fn test_repo_based_tag_drops_one_leading_dash() {
        let path = format!("source.example.com/{}/{}:v1", "p".repeat(10), "y".repeat(48));
        let tag = RepoBasedTagGenerator
            .generate_tag(&wrap(&path), &destination())
            .unwrap();
        assert_eq!(
            tag.tag().unwrap(),
            format!("{}-sha256-{}.imgpkg", "y".repeat(48), HEX)
        );
    }

    #[test]
    fn test_digest_wrap_requires_digest() {
        assert!(DigestWrap::parse("source.example.com/team/app:v1", "").is_err());
    }
}
