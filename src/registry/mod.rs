//! Registry collaborator interface
//!
//! The core only decides what to fetch, write and verify. How a request reaches
//! a registry is behind the [`Registry`] trait; [`client::RegistryClient`] is the
//! HTTP implementation used by the command line front-end.

pub mod auth;
pub mod client;
pub mod retry;

pub use client::{Credentials, RegistryClient, RegistryClientBuilder};
pub use retry::RetryPolicy;

use crate::error::{RegistryError, Result};
use crate::image::descriptor::{ConfigDescriptor, ImageLayerDescriptor, ManifestDescriptor};
use crate::image::digest::Digest;
use crate::image::layer::{LayerContents, compute_diff_id};
use crate::image::manifest::{
    self, ContentDescriptor, ManifestType, is_gzip_layer, is_uncompressed_layer,
};
use crate::image::reference::{ImageReference, Repository};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// A manifest as served by a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    pub manifest: Vec<u8>,
}

impl RemoteDescriptor {
    pub fn manifest_type(&self) -> ManifestType {
        ManifestType::from_media_type(&self.media_type)
    }
}

/// An image manifest with its config and per-layer metadata resolved
#[derive(Debug, Clone)]
pub struct RemoteImage {
    pub descriptor: RemoteDescriptor,
    pub config_digest: Digest,
    pub config: Vec<u8>,
    pub layers: Vec<ImageLayerDescriptor>,
}

/// An index manifest with its entries
#[derive(Debug, Clone)]
pub struct RemoteIndex {
    pub descriptor: RemoteDescriptor,
    pub manifests: Vec<ContentDescriptor>,
}

impl RemoteIndex {
    /// Parse the entries of an already fetched index manifest
    pub fn from_descriptor(reference: &ImageReference, descriptor: RemoteDescriptor) -> Result<Self> {
        if descriptor.manifest_type() != ManifestType::Index {
            return Err(RegistryError::Validation(format!(
                "{} is an image, expected an image index",
                reference
            )));
        }
        let manifests = manifest::parse_index_manifest(&descriptor.manifest)?.manifests;
        Ok(Self {
            descriptor,
            manifests,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactLayer {
    pub descriptor: ImageLayerDescriptor,
    pub contents: Arc<dyn LayerContents>,
}

#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub manifest: ManifestDescriptor,
    pub config: ConfigDescriptor,
    pub layers: Vec<ArtifactLayer>,
}

#[derive(Debug, Clone)]
pub struct IndexArtifact {
    pub media_type: String,
    pub digest: Digest,
    pub raw: String,
    pub indexes: Vec<IndexArtifact>,
    pub images: Vec<ImageArtifact>,
}

/// Something a registry can be asked to write under a reference
#[derive(Debug, Clone)]
pub enum Artifact {
    Image(ImageArtifact),
    Index(IndexArtifact),
    /// Already present in the destination registry at `from`; blobs are mounted
    /// across repositories instead of re-uploaded
    Mount {
        from: ImageReference,
        descriptor: RemoteDescriptor,
    },
}

impl Artifact {
    pub fn digest(&self) -> &Digest {
        match self {
            Artifact::Image(image) => &image.manifest.digest,
            Artifact::Index(index) => &index.digest,
            Artifact::Mount { descriptor, .. } => &descriptor.digest,
        }
    }
}

/// Reported by `multi_write` after each blob or manifest lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProgress {
    pub digest: Digest,
    pub bytes: u64,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the manifest `reference` points at
    async fn get(&self, reference: &ImageReference) -> Result<RemoteDescriptor>;

    /// Resolve `reference` to the digest of its manifest
    async fn digest(&self, reference: &ImageReference) -> Result<Digest>;

    /// Fetch a blob from `repository`
    async fn blob(&self, repository: &Repository, digest: &Digest) -> Result<Vec<u8>>;

    /// Write every artifact under its reference with at most `concurrency`
    /// uploads in flight
    async fn multi_write(
        &self,
        artifacts: BTreeMap<ImageReference, Artifact>,
        concurrency: usize,
        progress: Option<UnboundedSender<WriteProgress>>,
    ) -> Result<()>;

    /// A registry that only carries credentials for the host of `repository`
    fn clone_with_single_auth(&self, repository: &Repository) -> Result<Arc<dyn Registry>>;

    /// Fetch an image manifest together with its config and layer metadata
    async fn image(&self, reference: &ImageReference) -> Result<RemoteImage> {
        let descriptor = self.get(reference).await?;
        self.image_from(reference, descriptor).await
    }

    /// Resolve the config and layer metadata of an already fetched image manifest
    async fn image_from(
        &self,
        reference: &ImageReference,
        descriptor: RemoteDescriptor,
    ) -> Result<RemoteImage> {
        if descriptor.manifest_type() == ManifestType::Index {
            return Err(RegistryError::Validation(format!(
                "{} is an image index, expected an image",
                reference
            )));
        }

        let parsed = manifest::parse_image_manifest(&descriptor.manifest)?;
        let config = self
            .blob(reference.repository(), &parsed.config.digest)
            .await?;
        if parsed.config.digest.algorithm() == crate::image::digest::SHA256 {
            parsed.config.digest.verify(&config)?;
        }
        let diff_ids = manifest::parse_image_config(&config)?.rootfs.diff_ids;

        let mut layers = Vec::with_capacity(parsed.layers.len());
        for (position, layer) in parsed.layers.iter().enumerate() {
            let diff_id = match diff_ids.get(position) {
                Some(diff_id) => diff_id.clone(),
                None if is_uncompressed_layer(&layer.media_type) => layer.digest.clone(),
                None if is_gzip_layer(&layer.media_type) => {
                    let blob = self.blob(reference.repository(), &layer.digest).await?;
                    compute_diff_id(&blob)?
                }
                None => {
                    return Err(RegistryError::Parse(format!(
                        "Config of {} has no diff ID for layer {}",
                        reference, layer.digest
                    )));
                }
            };
            layers.push(ImageLayerDescriptor {
                media_type: layer.media_type.clone(),
                digest: layer.digest.clone(),
                diff_id,
                size: layer.size,
            });
        }

        Ok(RemoteImage {
            descriptor,
            config_digest: parsed.config.digest,
            config,
            layers,
        })
    }

    /// Fetch an index manifest and its entries
    async fn index(&self, reference: &ImageReference) -> Result<RemoteIndex> {
        let descriptor = self.get(reference).await?;
        RemoteIndex::from_descriptor(reference, descriptor)
    }
}
