//! Descriptor graph construction
//!
//! [`DescriptorGraph::build`] walks every input reference through the registry
//! collaborator, expanding indexes into their nested images and indexes. While
//! walking it records where the bytes of every discovered layer live, so the
//! graph can later hand out layer contents without another manifest lookup.

use crate::concurrency::{Throttle, settle_all};
use crate::error::{RegistryError, Result};
use crate::image::descriptor::{
    ConfigDescriptor, ImageDescriptor, ImageIndexDescriptor, ImageLayerDescriptor,
    ImageOrImageIndexDescriptor, ManifestDescriptor,
};
use crate::image::digest::SHA256;
use crate::image::layer::{LayerContents, RegistryLayer};
use crate::image::manifest::{ContentDescriptor, ManifestType, is_legacy_media_type};
use crate::image::reference::{ImageReference, Metadata};
use crate::logging::Logger;
use crate::registry::{
    Artifact, ArtifactLayer, ImageArtifact, IndexArtifact, Registry, RemoteDescriptor, RemoteImage,
    RemoteIndex, RetryPolicy,
};
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// Deepest index nesting accepted before a build fails
pub const MAX_INDEX_DEPTH: usize = 16;
/// Registry calls in flight while describing, unless configured otherwise
pub const DEFAULT_BUILD_CONCURRENCY: usize = 10;

type LayerTable = HashMap<ImageLayerDescriptor, Arc<dyn LayerContents>>;

#[derive(Debug)]
pub struct DescriptorGraph {
    descriptors: Vec<ImageOrImageIndexDescriptor>,
    layers: Mutex<LayerTable>,
}

impl DescriptorGraph {
    /// Resolve every reference in `refs` into image and index descriptors.
    ///
    /// All references are described concurrently with at most `concurrency`
    /// registry calls in flight. Every launched lookup runs to completion; the
    /// first failure in input order is returned.
    pub async fn build(
        refs: Vec<Metadata>,
        registry: Arc<dyn Registry>,
        concurrency: usize,
        retry: RetryPolicy,
        logger: &Logger,
    ) -> Result<Self> {
        let builder = GraphBuilder {
            registry,
            throttle: Throttle::new(concurrency),
            retry,
            logger: logger.clone(),
            layers: Mutex::new(HashMap::new()),
        };

        logger.step(&format!("Describing {} reference(s)", refs.len()));
        let descriptors =
            settle_all(refs.into_iter().map(|meta| builder.describe(meta))).await?;

        let layers = builder.layers.into_inner().map_err(poisoned)?;
        logger.detail(&format!(
            "Found {} artifact(s) with {} distinct layer(s)",
            descriptors.len(),
            layers.len()
        ));
        Ok(Self::from_parts(descriptors, layers))
    }

    /// Assemble a graph from already resolved descriptors and their layer contents
    pub fn from_parts(descriptors: Vec<ImageOrImageIndexDescriptor>, layers: LayerTable) -> Self {
        Self {
            descriptors,
            layers: Mutex::new(layers),
        }
    }

    pub fn descriptors(&self) -> &[ImageOrImageIndexDescriptor] {
        &self.descriptors
    }

    /// Descriptors ordered by their sort key
    pub fn sorted_descriptors(&self) -> Vec<ImageOrImageIndexDescriptor> {
        let mut sorted = self.descriptors.clone();
        sorted.sort_by_key(|item| item.sort_key());
        sorted
    }

    /// JSON encoding of the descriptor list, identical for identical input sets
    /// regardless of the order they were built in
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.sorted_descriptors())?)
    }

    /// Decode a descriptor list produced by [`DescriptorGraph::as_bytes`]
    pub fn descriptors_from_bytes(bytes: &[u8]) -> Result<Vec<ImageOrImageIndexDescriptor>> {
        serde_json::from_slice(bytes)
            .map_err(|e| RegistryError::Parse(format!("Invalid descriptor list: {}", e)))
    }

    /// Every distinct layer reachable from the graph, ordered by digest
    pub fn layer_descriptors(&self) -> Vec<ImageLayerDescriptor> {
        let distinct: BTreeSet<&ImageLayerDescriptor> = self
            .descriptors
            .iter()
            .flat_map(|item| item.layers())
            .collect();
        distinct.into_iter().cloned().collect()
    }

    /// Where the bytes of `layer` live.
    ///
    /// Asking for a layer the graph never registered is an internal error.
    pub fn find_layer(&self, layer: &ImageLayerDescriptor) -> Result<Arc<dyn LayerContents>> {
        let table = self.layers.lock().map_err(poisoned)?;
        table.get(layer).cloned().ok_or_else(|| {
            RegistryError::Internal(format!(
                "Expected to find layer {} (diff ID {}) in the descriptor graph",
                layer.digest, layer.diff_id
            ))
        })
    }

    /// Writable form of `item` with every layer bound to its contents
    pub fn artifact(&self, item: &ImageOrImageIndexDescriptor) -> Result<Artifact> {
        match item {
            ImageOrImageIndexDescriptor::Image(image) => Ok(Artifact::Image(self.image_artifact(image)?)),
            ImageOrImageIndexDescriptor::Index(index) => Ok(Artifact::Index(self.index_artifact(index)?)),
        }
    }

    fn image_artifact(&self, image: &ImageDescriptor) -> Result<ImageArtifact> {
        let layers = image
            .layers
            .iter()
            .map(|layer| {
                Ok(ArtifactLayer {
                    descriptor: layer.clone(),
                    contents: self.find_layer(layer)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ImageArtifact {
            manifest: image.manifest.clone(),
            config: image.config.clone(),
            layers,
        })
    }

    fn index_artifact(&self, index: &ImageIndexDescriptor) -> Result<IndexArtifact> {
        Ok(IndexArtifact {
            media_type: index.media_type.clone(),
            digest: index.digest.clone(),
            raw: index.raw.clone(),
            indexes: index
                .indexes
                .iter()
                .map(|nested| self.index_artifact(nested))
                .collect::<Result<_>>()?,
            images: index
                .images
                .iter()
                .map(|nested| self.image_artifact(nested))
                .collect::<Result<_>>()?,
        })
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> RegistryError {
    RegistryError::Internal("Layer table lock poisoned".to_string())
}

struct GraphBuilder {
    registry: Arc<dyn Registry>,
    throttle: Throttle,
    retry: RetryPolicy,
    logger: Logger,
    layers: Mutex<LayerTable>,
}

impl GraphBuilder {
    fn layer_table(&self) -> Result<MutexGuard<'_, LayerTable>> {
        self.layers.lock().map_err(poisoned)
    }

    /// One gated, retried registry call whose failure names `reference`
    async fn call<T, F, Fut>(&self, reference: &ImageReference, action: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.throttle.take().await?;
        let description = format!("{} {}", action, reference);
        self.retry
            .run(&self.logger, &description, operation)
            .await
            .map_err(|e| registry_failure(e, reference))
    }

    async fn describe(&self, meta: Metadata) -> Result<ImageOrImageIndexDescriptor> {
        let reference = meta.reference.clone();
        let descriptor = self
            .call(&reference, "Fetching manifest", || self.registry.get(&reference))
            .await?;
        check_supported(&descriptor.media_type, &reference)?;

        match descriptor.manifest_type() {
            ManifestType::Index => {
                let index = RemoteIndex::from_descriptor(&reference, descriptor)
                    .map_err(|e| e.with_reference(reference.to_string()))?;
                self.describe_index(meta, index, 0)
                    .await
                    .map(ImageOrImageIndexDescriptor::Index)
            }
            ManifestType::Image => {
                let image = self
                    .call(&reference, "Fetching image config", || {
                        self.registry.image_from(&reference, descriptor.clone())
                    })
                    .await?;
                self.describe_image(meta, image)
                    .map(ImageOrImageIndexDescriptor::Image)
            }
        }
    }

    fn describe_index(
        &self,
        meta: Metadata,
        index: RemoteIndex,
        depth: usize,
    ) -> BoxFuture<'_, Result<ImageIndexDescriptor>> {
        Box::pin(async move {
            let reference = meta.reference.clone();
            if depth >= MAX_INDEX_DEPTH {
                return Err(RegistryError::Validation(format!(
                    "Index nesting deeper than {} levels",
                    MAX_INDEX_DEPTH
                ))
                .with_reference(reference.to_string()));
            }
            let RemoteIndex {
                descriptor,
                manifests: entries,
            } = index;
            verify_manifest(&descriptor, &reference)?;

            self.logger.detail(&format!(
                "Index {} lists {} manifest(s)",
                reference,
                entries.len()
            ));

            let lookups: Vec<_> = entries
                .into_iter()
                .map(|entry| self.describe_entry(&meta, entry, depth))
                .collect();
            let children = settle_all(lookups).await?;

            let mut indexes = Vec::new();
            let mut images = Vec::new();
            for child in children {
                match child {
                    ImageOrImageIndexDescriptor::Index(index) => indexes.push(index),
                    ImageOrImageIndexDescriptor::Image(image) => images.push(image),
                }
            }

            Ok(ImageIndexDescriptor {
                refs: vec![reference.with_digest(&descriptor.digest).to_string()],
                media_type: descriptor.media_type,
                digest: descriptor.digest,
                raw: String::from_utf8(descriptor.manifest)?,
                indexes,
                images,
                tag: meta.tag,
                labels: meta.labels,
                orig_ref: meta.orig_ref,
            })
        })
    }

    /// Describe one entry of an index, classified by the media type the index
    /// declares for it
    async fn describe_entry(
        &self,
        parent: &Metadata,
        entry: ContentDescriptor,
        depth: usize,
    ) -> Result<ImageOrImageIndexDescriptor> {
        let meta = Metadata {
            reference: parent.reference.with_digest(&entry.digest),
            tag: parent.tag.clone(),
            labels: parent.labels.clone(),
            orig_ref: parent.orig_ref.clone(),
        };
        check_supported(&entry.media_type, &meta.reference)?;

        match ManifestType::from_media_type(&entry.media_type) {
            ManifestType::Index => {
                let reference = meta.reference.clone();
                let index = self
                    .call(&reference, "Fetching index", || self.registry.index(&reference))
                    .await?;
                self.describe_index(meta, index, depth + 1)
                    .await
                    .map(ImageOrImageIndexDescriptor::Index)
            }
            ManifestType::Image => {
                let reference = meta.reference.clone();
                let image = self
                    .call(&reference, "Fetching image", || self.registry.image(&reference))
                    .await?;
                self.describe_image(meta, image)
                    .map(ImageOrImageIndexDescriptor::Image)
            }
        }
    }

    /// Register the layers of a fetched image and describe it
    fn describe_image(&self, meta: Metadata, image: RemoteImage) -> Result<ImageDescriptor> {
        let reference = meta.reference.clone();
        check_supported(&image.descriptor.media_type, &reference)?;
        verify_manifest(&image.descriptor, &reference)?;

        {
            let mut table = self.layer_table()?;
            for layer in &image.layers {
                table.entry(layer.clone()).or_insert_with(|| {
                    Arc::new(RegistryLayer::new(
                        Arc::clone(&self.registry),
                        reference.repository().clone(),
                        layer.digest.clone(),
                        self.retry,
                        self.logger.clone(),
                    ))
                });
            }
        }
        self.logger.detail(&format!(
            "Image {} has {} layer(s)",
            reference,
            image.layers.len()
        ));

        let wrap = |e: RegistryError| e.with_reference(reference.to_string());
        Ok(ImageDescriptor {
            refs: vec![reference.with_digest(&image.descriptor.digest).to_string()],
            manifest: ManifestDescriptor {
                media_type: image.descriptor.media_type,
                digest: image.descriptor.digest,
                raw: String::from_utf8(image.descriptor.manifest).map_err(|e| wrap(e.into()))?,
            },
            config: ConfigDescriptor {
                digest: image.config_digest,
                raw: String::from_utf8(image.config).map_err(|e| wrap(e.into()))?,
            },
            layers: image.layers,
            tag: meta.tag,
            labels: meta.labels,
            orig_ref: meta.orig_ref,
        })
    }
}

fn check_supported(media_type: &str, reference: &ImageReference) -> Result<()> {
    if is_legacy_media_type(media_type) {
        return Err(RegistryError::UnsupportedFormat(format!(
            "Docker schema 1 manifest ({}); only v2 or OCI image formats are supported",
            media_type
        ))
        .with_reference(reference.to_string()));
    }
    Ok(())
}

/// A digest reference must serve exactly the manifest it names
fn verify_manifest(descriptor: &RemoteDescriptor, reference: &ImageReference) -> Result<()> {
    match reference.digest() {
        Some(expected) if expected.algorithm() == SHA256 => expected
            .verify(&descriptor.manifest)
            .map_err(|e| e.with_reference(reference.to_string())),
        _ => Ok(()),
    }
}

fn registry_failure(err: RegistryError, reference: &ImageReference) -> RegistryError {
    let err = if err.to_string().contains("MANIFEST_UNKNOWN") {
        RegistryError::UnsupportedFormat(format!(
            "Manifest unknown, most likely because the image is in Docker Registry v1 format; \
             only v2 or OCI image formats are supported (underlying error: {})",
            err
        ))
    } else {
        err
    };
    err.with_reference(reference.to_string())
}
