//! Resolved descriptors of images, indexes and layers
//!
//! These are the serialized form of a descriptor graph: raw manifests and configs
//! are kept verbatim so an artifact can be rewritten byte-for-byte and keep its
//! digest.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::reference::ImageReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One layer of an image.
///
/// Two descriptors with equal media type, digest, diff ID and size describe the
/// same physical content and resolve to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayerDescriptor {
    pub media_type: String,
    /// Digest of the (possibly compressed) blob
    pub digest: Digest,
    /// Digest of the uncompressed content
    pub diff_id: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDescriptor {
    pub digest: Digest,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    /// References that resolved to this image; never empty once built
    pub refs: Vec<String>,
    pub manifest: ManifestDescriptor,
    pub config: ConfigDescriptor,
    pub layers: Vec<ImageLayerDescriptor>,
    pub tag: String,
    pub labels: BTreeMap<String, String>,
    pub orig_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndexDescriptor {
    pub refs: Vec<String>,
    pub media_type: String,
    pub digest: Digest,
    pub raw: String,
    pub indexes: Vec<ImageIndexDescriptor>,
    pub images: Vec<ImageDescriptor>,
    pub tag: String,
    pub labels: BTreeMap<String, String>,
    pub orig_ref: String,
}

/// Exactly one of an image or an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageOrImageIndexDescriptor {
    Image(ImageDescriptor),
    Index(ImageIndexDescriptor),
}

fn first_ref(refs: &[String], digest: &Digest) -> Result<ImageReference> {
    let raw = refs.first().ok_or_else(|| {
        RegistryError::Internal(format!("Descriptor {} has no references", digest))
    })?;
    ImageReference::parse(raw)
}

impl ImageDescriptor {
    pub fn digest(&self) -> &Digest {
        &self.manifest.digest
    }

    /// The digest reference this image was built from
    pub fn primary_ref(&self) -> Result<ImageReference> {
        first_ref(&self.refs, self.digest())
    }
}

impl ImageIndexDescriptor {
    pub fn primary_ref(&self) -> Result<ImageReference> {
        first_ref(&self.refs, &self.digest)
    }

    fn collect_layers<'a>(&'a self, out: &mut Vec<&'a ImageLayerDescriptor>) {
        for index in &self.indexes {
            index.collect_layers(out);
        }
        for image in &self.images {
            out.extend(image.layers.iter());
        }
    }
}

impl ImageOrImageIndexDescriptor {
    pub fn digest(&self) -> &Digest {
        match self {
            Self::Image(image) => image.digest(),
            Self::Index(index) => &index.digest,
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Self::Image(image) => &image.manifest.media_type,
            Self::Index(index) => &index.media_type,
        }
    }

    pub fn refs(&self) -> &[String] {
        match self {
            Self::Image(image) => &image.refs,
            Self::Index(index) => &index.refs,
        }
    }

    pub fn primary_ref(&self) -> Result<ImageReference> {
        match self {
            Self::Image(image) => image.primary_ref(),
            Self::Index(index) => index.primary_ref(),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Image(image) => &image.tag,
            Self::Index(index) => &index.tag,
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Image(image) => &image.labels,
            Self::Index(index) => &index.labels,
        }
    }

    pub fn orig_ref(&self) -> &str {
        match self {
            Self::Image(image) => &image.orig_ref,
            Self::Index(index) => &index.orig_ref,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    /// Key that orders descriptors reproducibly regardless of build order
    pub fn sort_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.digest(),
            self.tag(),
            self.orig_ref(),
            self.refs().join(",")
        )
    }

    /// Every layer reachable from this descriptor, in manifest order
    pub fn layers(&self) -> Vec<&ImageLayerDescriptor> {
        match self {
            Self::Image(image) => image.layers.iter().collect(),
            Self::Index(index) => {
                let mut out = Vec::new();
                index.collect_layers(&mut out);
                out
            }
        }
    }
}
