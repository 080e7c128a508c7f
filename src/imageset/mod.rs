//! Export, import and relocation of image sets
//!
//! [`ImageSet`] drives the whole flow:
//!
//! - **export** builds a descriptor graph for a set of digest references,
//! - **import** writes every artifact of a graph into a destination repository
//!   under a derived tag, then reads each tag back and checks its digest,
//! - **relocate** is export immediately followed by import.
//!
//! Archives plug in between the two halves: an exported graph can be written to
//! a [`TarArchive`] and a graph read back from one can be imported.

pub mod processed;

pub use processed::{ProcessedImage, ProcessedImages, UnprocessedImageRef, UnprocessedImageRefs};

use crate::archive::TarArchive;
use crate::concurrency::{Throttle, fan_out};
use crate::config::RelocateConfig;
use crate::error::{RegistryError, Result};
use crate::image::descriptor::ImageOrImageIndexDescriptor;
use crate::image::graph::{DEFAULT_BUILD_CONCURRENCY, DescriptorGraph};
use crate::image::reference::{ImageReference, Metadata, Repository};
use crate::image::tag::{DigestWrap, TagGenerator, TagStrategy};
use crate::logging::Logger;
use crate::registry::{Artifact, Registry, RemoteDescriptor, RetryPolicy};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Number of artifacts imported concurrently unless configured otherwise
pub const DEFAULT_IMPORT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone)]
pub struct ImageSet {
    concurrency: usize,
    build_concurrency: usize,
    retry: RetryPolicy,
    logger: Logger,
    tag_generator: Arc<dyn TagGenerator>,
}

impl ImageSet {
    pub fn new(concurrency: usize, logger: Logger) -> Self {
        Self {
            concurrency: concurrency.max(1),
            build_concurrency: DEFAULT_BUILD_CONCURRENCY,
            retry: RetryPolicy::default(),
            logger,
            tag_generator: TagStrategy::Default.generator(),
        }
    }

    pub fn from_config(config: &RelocateConfig, logger: Logger) -> Self {
        Self::new(config.concurrency, logger)
            .with_build_concurrency(config.build_concurrency)
            .with_retry(config.retry)
            .with_tag_generator(config.tag_strategy.generator())
    }

    pub fn with_build_concurrency(mut self, build_concurrency: usize) -> Self {
        self.build_concurrency = build_concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tag_generator(mut self, tag_generator: Arc<dyn TagGenerator>) -> Self {
        self.tag_generator = tag_generator;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Turn caller supplied references into digest references.
    ///
    /// Tag references are resolved against `registry` and keep their tag.
    pub async fn resolve(
        &self,
        refs: &[String],
        registry: Arc<dyn Registry>,
    ) -> Result<UnprocessedImageRefs> {
        let throttle = Throttle::new(self.concurrency);
        let resolved = fan_out(&throttle, refs.iter(), |input| {
            let registry = Arc::clone(&registry);
            async move {
                let reference = ImageReference::parse(input)?;
                if reference.digest().is_some() {
                    return Ok(UnprocessedImageRef::new(reference.to_string(), "", input.as_str()));
                }

                let description = format!("Resolving {}", reference);
                let digest = self
                    .retry
                    .run(&self.logger, &description, || registry.digest(&reference))
                    .await
                    .map_err(|e| e.with_reference(reference.to_string()))?;
                self.logger
                    .detail(&format!("{} resolved to {}", reference, digest));
                Ok(UnprocessedImageRef::new(
                    reference.with_digest(&digest).to_string(),
                    reference.tag().unwrap_or_default(),
                    input.as_str(),
                ))
            }
        })
        .await?;

        let unprocessed = UnprocessedImageRefs::new();
        for image_ref in resolved {
            unprocessed.add(image_ref)?;
        }
        Ok(unprocessed)
    }

    /// Describe every artifact in `refs`
    pub async fn export(
        &self,
        refs: &UnprocessedImageRefs,
        registry: Arc<dyn Registry>,
    ) -> Result<DescriptorGraph> {
        self.logger.section("Export");
        let metadata = refs
            .all()?
            .into_iter()
            .map(|image_ref| {
                Ok(Metadata {
                    reference: image_ref.reference()?,
                    tag: image_ref.tag,
                    labels: image_ref.labels,
                    orig_ref: image_ref.orig_ref,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let graph =
            DescriptorGraph::build(metadata, registry, self.build_concurrency, self.retry, &self.logger)
                .await?;
        self.logger.success(&format!(
            "Described {} artifact(s) with {} layer(s)",
            graph.descriptors().len(),
            graph.layer_descriptors().len()
        ));
        Ok(graph)
    }

    /// Export `refs` into `archive`
    pub async fn export_to_archive(
        &self,
        refs: &UnprocessedImageRefs,
        registry: Arc<dyn Registry>,
        archive: &TarArchive,
        resume: bool,
    ) -> Result<DescriptorGraph> {
        let graph = self.export(refs, registry).await?;
        archive.write(&graph, resume).await?;
        Ok(graph)
    }

    /// Write every artifact of `graph` into `destination` and verify it landed
    pub async fn import(
        &self,
        graph: &DescriptorGraph,
        destination: &Repository,
        registry: Arc<dyn Registry>,
    ) -> Result<ProcessedImages> {
        self.logger.section("Import");
        let items = graph.sorted_descriptors();
        if items.is_empty() {
            self.logger.info("Nothing to import");
            return Ok(ProcessedImages::new());
        }

        self.write_artifacts(graph, &items, destination, &registry)
            .await?;
        let processed = self.verify_artifacts(&items, destination, &registry).await?;

        self.logger.success(&format!(
            "Imported {} artifact(s) into {}",
            processed.len(),
            destination
        ));
        Ok(processed)
    }

    /// Import every artifact recorded in `archive`
    pub async fn import_from_archive(
        &self,
        archive: &TarArchive,
        destination: &Repository,
        registry: Arc<dyn Registry>,
    ) -> Result<ProcessedImages> {
        let graph = archive.read()?;
        self.import(&graph, destination, registry).await
    }

    /// Export from `source` and import into `destination` without touching disk
    pub async fn relocate(
        &self,
        refs: &UnprocessedImageRefs,
        destination: &Repository,
        source: Arc<dyn Registry>,
        target: Arc<dyn Registry>,
    ) -> Result<ProcessedImages> {
        let graph = self.export(refs, source).await?;
        self.import(&graph, destination, target).await
    }

    fn upload_tag(
        &self,
        item: &ImageOrImageIndexDescriptor,
        destination: &Repository,
    ) -> Result<(ImageReference, ImageReference)> {
        let source_ref = item.primary_ref()?;
        let wrap = DigestWrap::new(source_ref.clone(), item.orig_ref())?;
        let tag_ref = self.tag_generator.generate_tag(&wrap, destination)?;
        Ok((source_ref, tag_ref))
    }

    async fn write_artifacts(
        &self,
        graph: &DescriptorGraph,
        items: &[ImageOrImageIndexDescriptor],
        destination: &Repository,
        registry: &Arc<dyn Registry>,
    ) -> Result<()> {
        let throttle = Throttle::new(self.concurrency);
        let chosen = fan_out(&throttle, items.iter(), |item| async move {
            let (source_ref, tag_ref) = self.upload_tag(item, destination)?;
            let artifact = match self.mount_source(&source_ref, destination, registry).await {
                Some(descriptor) => {
                    self.logger
                        .detail(&format!("Mounting {} from {}", tag_ref, source_ref));
                    Artifact::Mount {
                        from: source_ref,
                        descriptor,
                    }
                }
                None => graph.artifact(item)?,
            };
            Ok((tag_ref, artifact))
        })
        .await?;
        let artifacts: BTreeMap<ImageReference, Artifact> = chosen.into_iter().collect();

        self.logger.step(&format!(
            "Writing {} artifact(s) to {}",
            artifacts.len(),
            destination
        ));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let write = async {
            let result = self
                .retry
                .run(&self.logger, "Writing artifacts", || {
                    registry.multi_write(artifacts.clone(), self.concurrency, Some(sender.clone()))
                })
                .await;
            drop(sender);
            result
        };
        let drain = async {
            let mut written = 0u64;
            let mut bytes = 0u64;
            while let Some(progress) = receiver.recv().await {
                written += 1;
                bytes += progress.bytes;
            }
            (written, bytes)
        };

        let (result, (written, bytes)) = tokio::join!(write, drain);
        result.map_err(|e| e.with_reference(destination.to_string()))?;
        self.logger.info(&format!(
            "Wrote {} blob(s) and manifest(s), {}",
            written,
            self.logger.format_size(bytes)
        ));
        Ok(())
    }

    /// The source manifest, when the destination registry can serve it to a
    /// client holding only destination credentials
    async fn mount_source(
        &self,
        source_ref: &ImageReference,
        destination: &Repository,
        registry: &Arc<dyn Registry>,
    ) -> Option<RemoteDescriptor> {
        if source_ref.registry() != destination.registry() {
            return None;
        }
        let scoped = match registry.clone_with_single_auth(destination) {
            Ok(scoped) => scoped,
            Err(e) => {
                self.logger
                    .debug(&format!("No scoped registry for {}: {}", destination, e));
                return None;
            }
        };
        match scoped.get(source_ref).await {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                self.logger
                    .debug(&format!("Not mounting {}: {}", source_ref, e));
                None
            }
        }
    }

    async fn verify_artifacts(
        &self,
        items: &[ImageOrImageIndexDescriptor],
        destination: &Repository,
        registry: &Arc<dyn Registry>,
    ) -> Result<ProcessedImages> {
        let throttle = Throttle::new(self.concurrency);
        let processed = ProcessedImages::new();
        fan_out(&throttle, items.iter(), |item| {
            let processed = &processed;
            async move {
                let (source_ref, tag_ref) = self.upload_tag(item, destination)?;
                let expected = destination.digest(item.digest());

                let description = format!("Verifying {}", tag_ref);
                let actual = self
                    .retry
                    .run(&self.logger, &description, || registry.digest(&tag_ref))
                    .await
                    .map_err(|e| e.with_reference(tag_ref.to_string()))?;
                if &actual != item.digest() {
                    return Err(RegistryError::Verification(format!(
                        "Expected {} to resolve to {}, registry returned {}",
                        tag_ref,
                        item.digest(),
                        actual
                    ))
                    .with_reference(source_ref.to_string()));
                }

                let (image, image_index) = match item {
                    ImageOrImageIndexDescriptor::Image(image) => (Some(image.clone()), None),
                    ImageOrImageIndexDescriptor::Index(index) => (None, Some(index.clone())),
                };
                processed.add(ProcessedImage {
                    unprocessed_image_ref: UnprocessedImageRef {
                        digest_ref: source_ref.to_string(),
                        tag: item.tag().to_string(),
                        labels: item.labels().clone(),
                        orig_ref: item.orig_ref().to_string(),
                    },
                    digest_ref: expected.to_string(),
                    image,
                    image_index,
                })
            }
        })
        .await?;
        Ok(processed)
    }
}
