//! Manifest media types and JSON models
//!
//! Covers Docker v2 schema 2 and OCI image manifests, Docker manifest lists and
//! OCI image indexes, and the parts of an image config this crate reads.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use serde::{Deserialize, Serialize};

pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Media types sent in the Accept header of manifest requests
pub const ACCEPTED_MANIFEST_TYPES: [&str; 4] = [
    OCI_IMAGE_INDEX,
    OCI_IMAGE_MANIFEST,
    DOCKER_MANIFEST_LIST,
    DOCKER_MANIFEST,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    Index,
    Image,
}

impl ManifestType {
    /// OCI indexes and Docker manifest lists are indexes, everything else is an image
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type {
            OCI_IMAGE_INDEX | DOCKER_MANIFEST_LIST => ManifestType::Index,
            _ => ManifestType::Image,
        }
    }
}

/// Docker schema 1 manifests cannot be relocated
pub fn is_legacy_media_type(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED)
}

pub fn is_gzip_layer(media_type: &str) -> bool {
    media_type.ends_with("+gzip") || media_type.ends_with(".gzip")
}

pub fn is_uncompressed_layer(media_type: &str) -> bool {
    media_type.ends_with(".tar") || media_type.ends_with(".v1.tar")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: ContentDescriptor,
    #[serde(default)]
    pub layers: Vec<ContentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<ContentDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootFs {
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// The subset of an image config needed to pair layers with their diff IDs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub rootfs: RootFs,
}

/// Read only the `mediaType` of a manifest body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeFields {
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
}

pub fn parse_image_manifest(raw: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(raw)
        .map_err(|e| RegistryError::Parse(format!("Failed to parse image manifest: {}", e)))
}

pub fn parse_index_manifest(raw: &[u8]) -> Result<IndexManifest> {
    serde_json::from_slice(raw)
        .map_err(|e| RegistryError::Parse(format!("Failed to parse image index: {}", e)))
}

pub fn parse_image_config(raw: &[u8]) -> Result<ImageConfig> {
    serde_json::from_slice(raw)
        .map_err(|e| RegistryError::Parse(format!("Failed to parse image config: {}", e)))
}

/// Media type declared inside a manifest body, inferred when absent
pub fn detect_media_type(raw: &[u8]) -> Result<String> {
    let fields: MediaTypeFields = serde_json::from_slice(raw)
        .map_err(|e| RegistryError::Parse(format!("Failed to parse manifest: {}", e)))?;
    Ok(match (fields.media_type, fields.manifests) {
        (Some(media_type), _) => media_type,
        (None, Some(_)) => OCI_IMAGE_INDEX.to_string(),
        (None, None) => OCI_IMAGE_MANIFEST.to_string(),
    })
}
