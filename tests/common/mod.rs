//! In-memory registry used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::future::BoxFuture;
use image_relocator::error::{RegistryError, Result};
use image_relocator::image::manifest::{
    OCI_IMAGE_CONFIG, OCI_IMAGE_INDEX, OCI_IMAGE_MANIFEST, OCI_LAYER_TAR_GZIP,
};
use image_relocator::image::{Digest, ImageReference, Repository};
use image_relocator::registry::{
    Artifact, ImageArtifact, IndexArtifact, Registry, RemoteDescriptor, WriteProgress,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// What a pushed image consists of
#[derive(Debug, Clone)]
pub struct PushedImage {
    pub digest: Digest,
    pub config: Digest,
    pub layers: Vec<Digest>,
}

#[derive(Default)]
struct State {
    /// (repository, digest) → (media type, manifest bytes)
    manifests: HashMap<(Repository, Digest), (String, Vec<u8>)>,
    tags: HashMap<ImageReference, Digest>,
    blobs: HashMap<Digest, Vec<u8>>,
    blob_reads: HashMap<Digest, usize>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    mounts: AtomicUsize,
    writes: AtomicUsize,
    manifest_reads: AtomicUsize,
    failures_left: AtomicUsize,
    corrupt_tags: AtomicBool,
    refuse_scoped_clients: AtomicBool,
    deny_scoped_reads: AtomicBool,
}

/// A registry serving every host from memory. Blobs are shared across
/// repositories; manifests and tags are kept per repository.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    inner: Arc<Inner>,
    /// Set on clients handed out by `clone_with_single_auth`
    scoped: bool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn Registry> {
        Arc::new(self.clone())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    fn put_blob(&self, data: Vec<u8>) -> Digest {
        let digest = Digest::sha256(&data);
        self.state().blobs.insert(digest.clone(), data);
        digest
    }

    pub fn put_manifest(&self, reference: &ImageReference, media_type: &str, raw: Vec<u8>) -> Digest {
        let digest = Digest::sha256(&raw);
        let mut state = self.state();
        state.manifests.insert(
            (reference.repository().clone(), digest.clone()),
            (media_type.to_string(), raw),
        );
        if reference.tag().is_some() {
            state.tags.insert(reference.clone(), digest.clone());
        }
        digest
    }

    /// Push an image with one gzip layer per entry of `layers`, tagged `repo:tag`
    pub fn push_image(&self, repo: &str, tag: &str, layers: &[&[u8]]) -> PushedImage {
        let reference = ImageReference::parse(&format!("{}:{}", repo, tag)).unwrap();

        let mut layer_descriptors = Vec::new();
        let mut layer_digests = Vec::new();
        let mut diff_ids = Vec::new();
        for raw in layers {
            let compressed = gzip(raw);
            let size = compressed.len();
            let digest = self.put_blob(compressed);
            diff_ids.push(Digest::sha256(raw).to_string());
            layer_descriptors.push(json!({
                "mediaType": OCI_LAYER_TAR_GZIP,
                "digest": digest.to_string(),
                "size": size,
            }));
            layer_digests.push(digest);
        }

        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Labels": { "source": format!("{}:{}", repo, tag) } },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        }))
        .unwrap();
        let config_size = config.len();
        let config_digest = self.put_blob(config);

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_MANIFEST,
            "config": {
                "mediaType": OCI_IMAGE_CONFIG,
                "digest": config_digest.to_string(),
                "size": config_size,
            },
            "layers": layer_descriptors,
        }))
        .unwrap();

        PushedImage {
            digest: self.put_manifest(&reference, OCI_IMAGE_MANIFEST, manifest),
            config: config_digest,
            layers: layer_digests,
        }
    }

    /// Push an index over manifests already present in `repo`
    pub fn push_index(&self, repo: &str, tag: &str, children: &[Digest]) -> Digest {
        let reference = ImageReference::parse(&format!("{}:{}", repo, tag)).unwrap();
        let entries: Vec<_> = children
            .iter()
            .map(|digest| {
                let (media_type, raw) = self
                    .manifest(reference.repository(), digest)
                    .expect("index child must be pushed first");
                json!({
                    "mediaType": media_type,
                    "digest": digest.to_string(),
                    "size": raw.len(),
                    "platform": { "architecture": "amd64", "os": "linux" },
                })
            })
            .collect();
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX,
            "manifests": entries,
        }))
        .unwrap();
        self.put_manifest(&reference, OCI_IMAGE_INDEX, manifest)
    }

    pub fn manifest(&self, repository: &Repository, digest: &Digest) -> Option<(String, Vec<u8>)> {
        self.state()
            .manifests
            .get(&(repository.clone(), digest.clone()))
            .cloned()
    }

    pub fn tagged(&self, reference: &str) -> Option<Digest> {
        let reference = ImageReference::parse(reference).unwrap();
        self.state().tags.get(&reference).cloned()
    }

    pub fn remove_blob(&self, digest: &Digest) {
        self.state().blobs.remove(digest);
    }

    pub fn blob_reads(&self, digest: &Digest) -> usize {
        self.state().blob_reads.get(digest).copied().unwrap_or_default()
    }

    pub fn reset_blob_reads(&self) {
        self.state().blob_reads.clear();
    }

    pub fn mounts(&self) -> usize {
        self.inner.mounts.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Manifest GETs served so far
    pub fn manifest_reads(&self) -> usize {
        self.inner.manifest_reads.load(Ordering::SeqCst)
    }

    /// Fail the next `count` reads with a transient network error
    pub fn fail_next(&self, count: usize) {
        self.inner.failures_left.store(count, Ordering::SeqCst);
    }

    /// Make every tag resolve to a digest that does not match its content
    pub fn corrupt_tags(&self) {
        self.inner.corrupt_tags.store(true, Ordering::SeqCst);
    }

    /// Make `clone_with_single_auth` fail
    pub fn refuse_scoped_clients(&self) {
        self.inner.refuse_scoped_clients.store(true, Ordering::SeqCst);
    }

    /// Make manifest reads through a scoped client fail as unauthorized
    pub fn deny_scoped_reads(&self) {
        self.inner.deny_scoped_reads.store(true, Ordering::SeqCst);
    }

    /// Tag an existing manifest of `from` into `repo` as well
    pub fn copy_tagged(&self, from: &Repository, digest: &Digest, repo: &str, tag: &str) -> Digest {
        let reference = ImageReference::parse(&format!("{}:{}", repo, tag)).unwrap();
        let (media_type, raw) = self.manifest(from, digest).expect("manifest must be pushed first");
        self.put_manifest(&reference, &media_type, raw)
    }

    fn maybe_fail(&self) -> Result<()> {
        let left = &self.inner.failures_left;
        let took = left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(RegistryError::Network("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn resolve(&self, reference: &ImageReference) -> Result<Digest> {
        match reference.digest() {
            Some(digest) => Ok(digest.clone()),
            None => self.state().tags.get(reference).cloned().ok_or_else(|| {
                RegistryError::NotFound(format!("MANIFEST_UNKNOWN: {}", reference))
            }),
        }
    }

    fn report(progress: &Option<UnboundedSender<WriteProgress>>, digest: &Digest, bytes: usize) {
        if let Some(progress) = progress {
            let _ = progress.send(WriteProgress {
                digest: digest.clone(),
                bytes: bytes as u64,
            });
        }
    }

    async fn store_image(
        &self,
        target: &ImageReference,
        image: &ImageArtifact,
        progress: &Option<UnboundedSender<WriteProgress>>,
    ) -> Result<()> {
        for layer in &image.layers {
            let data = layer.contents.open().await?;
            layer.descriptor.digest.verify(&data)?;
            Self::report(progress, &layer.descriptor.digest, data.len());
            self.put_blob(data);
        }
        let config = image.config.raw.as_bytes().to_vec();
        Self::report(progress, &image.config.digest, config.len());
        self.put_blob(config);

        let raw = image.manifest.raw.as_bytes().to_vec();
        Self::report(progress, &image.manifest.digest, raw.len());
        self.put_manifest(target, &image.manifest.media_type, raw);
        Ok(())
    }

    fn store_index<'a>(
        &'a self,
        target: &'a ImageReference,
        index: &'a IndexArtifact,
        progress: &'a Option<UnboundedSender<WriteProgress>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for nested in &index.indexes {
                self.store_index(&target.with_digest(&nested.digest), nested, progress)
                    .await?;
            }
            for image in &index.images {
                self.store_image(&target.with_digest(&image.manifest.digest), image, progress)
                    .await?;
            }
            let raw = index.raw.as_bytes().to_vec();
            Self::report(progress, &index.digest, raw.len());
            self.put_manifest(target, &index.media_type, raw);
            Ok(())
        })
    }

    /// Copy a manifest and everything it lists from `from` without touching blobs
    fn copy_manifest(&self, target: &ImageReference, from: &ImageReference, digest: &Digest) -> Result<()> {
        let (media_type, raw) = self
            .manifest(from.repository(), digest)
            .ok_or_else(|| RegistryError::NotFound(format!("{}", from)))?;
        if media_type == OCI_IMAGE_INDEX {
            let parsed: serde_json::Value = serde_json::from_slice(&raw)?;
            for entry in parsed["manifests"].as_array().into_iter().flatten() {
                let child = Digest::parse(entry["digest"].as_str().unwrap_or_default())?;
                self.copy_manifest(&target.with_digest(&child), &from.with_digest(&child), &child)?;
            }
        }
        self.put_manifest(target, &media_type, raw);
        Ok(())
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn get(&self, reference: &ImageReference) -> Result<RemoteDescriptor> {
        self.maybe_fail()?;
        if self.scoped && self.inner.deny_scoped_reads.load(Ordering::SeqCst) {
            return Err(RegistryError::Auth(format!("UNAUTHORIZED: {}", reference)));
        }
        self.inner.manifest_reads.fetch_add(1, Ordering::SeqCst);
        let digest = self.resolve(reference)?;
        let (media_type, manifest) = self
            .manifest(reference.repository(), &digest)
            .ok_or_else(|| RegistryError::NotFound(format!("MANIFEST_UNKNOWN: {}", reference)))?;
        Ok(RemoteDescriptor {
            media_type,
            digest,
            size: manifest.len() as u64,
            manifest,
        })
    }

    async fn digest(&self, reference: &ImageReference) -> Result<Digest> {
        self.maybe_fail()?;
        let digest = self.resolve(reference)?;
        if reference.tag().is_some() && self.inner.corrupt_tags.load(Ordering::SeqCst) {
            return Ok(Digest::sha256(digest.to_string().as_bytes()));
        }
        Ok(digest)
    }

    async fn blob(&self, _repository: &Repository, digest: &Digest) -> Result<Vec<u8>> {
        self.maybe_fail()?;
        let mut state = self.state();
        *state.blob_reads.entry(digest.clone()).or_default() += 1;
        state
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("BLOB_UNKNOWN: {}", digest)))
    }

    async fn multi_write(
        &self,
        artifacts: BTreeMap<ImageReference, Artifact>,
        _concurrency: usize,
        progress: Option<UnboundedSender<WriteProgress>>,
    ) -> Result<()> {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        for (target, artifact) in &artifacts {
            match artifact {
                Artifact::Image(image) => self.store_image(target, image, &progress).await?,
                Artifact::Index(index) => self.store_index(target, index, &progress).await?,
                Artifact::Mount { from, descriptor } => {
                    self.inner.mounts.fetch_add(1, Ordering::SeqCst);
                    self.copy_manifest(target, from, &descriptor.digest)?;
                    Self::report(&progress, &descriptor.digest, descriptor.manifest.len());
                }
            }
        }
        Ok(())
    }

    fn clone_with_single_auth(&self, repository: &Repository) -> Result<Arc<dyn Registry>> {
        if self.inner.refuse_scoped_clients.load(Ordering::SeqCst) {
            return Err(RegistryError::Auth(format!("No credentials for {}", repository)));
        }
        Ok(Arc::new(Self {
            inner: self.inner.clone(),
            scoped: true,
        }))
    }
}
