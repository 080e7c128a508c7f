//! Tar archive codec
//!
//! An archive holds a `manifest.json` entry with the serialized descriptor graph
//! followed by one entry per distinct layer, named after the layer digest
//! (`sha256-<hex>.tar.gz`) and ordered by digest. Headers carry fixed metadata,
//! so the same graph always produces the same bytes.
//!
//! Writing goes to a temporary sibling file that replaces the target only once
//! complete. A resumed write copies layers that already verify in the previous
//! archive and fetches the rest.

pub mod tar_utils;

use crate::error::{RegistryError, Result};
use crate::image::descriptor::{ImageLayerDescriptor, ImageOrImageIndexDescriptor};
use crate::image::digest::Digest;
use crate::image::graph::DescriptorGraph;
use crate::image::layer::LayerContents;
use crate::logging::Logger;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar_utils::{EntryLocation, append_entry, index_entries, read_entry};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Entry name under which a layer is stored
pub fn layer_entry_name(digest: &Digest) -> String {
    format!("{}-{}.tar.gz", digest.algorithm(), digest.hex())
}

/// Layer bytes stored in an archive entry
#[derive(Debug, Clone)]
pub struct ArchiveLayer {
    path: PathBuf,
    location: EntryLocation,
}

#[async_trait]
impl LayerContents for ArchiveLayer {
    async fn open(&self) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.location.offset)).await?;
        let mut data = vec![0u8; self.location.size as usize];
        file.read_exact(&mut data).await?;
        Ok(data)
    }
}

/// Contents of an existing archive, indexed but not yet loaded
struct ArchiveIndex {
    descriptors: Vec<ImageOrImageIndexDescriptor>,
    entries: HashMap<String, EntryLocation>,
}

impl ArchiveIndex {
    fn distinct_layers(&self) -> Vec<ImageLayerDescriptor> {
        let mut seen = HashSet::new();
        let mut layers: Vec<ImageLayerDescriptor> = self
            .descriptors
            .iter()
            .flat_map(|item| item.layers())
            .filter(|layer| seen.insert((*layer).clone()))
            .cloned()
            .collect();
        layers.sort();
        layers
    }
}

#[derive(Debug, Clone)]
pub struct TarArchive {
    path: PathBuf,
    concurrency: usize,
    logger: Logger,
}

impl TarArchive {
    pub fn new(path: impl Into<PathBuf>, concurrency: usize, logger: Logger) -> Self {
        Self {
            path: path.into(),
            concurrency: concurrency.max(1),
            logger,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan(&self) -> Result<ArchiveIndex> {
        let entries = index_entries(&self.path)?;
        let manifest = entries.get(MANIFEST_ENTRY).copied().ok_or_else(|| {
            RegistryError::Validation(format!(
                "{} has no {} entry",
                self.path.display(),
                MANIFEST_ENTRY
            ))
        })?;
        let descriptors = DescriptorGraph::descriptors_from_bytes(&read_entry(&self.path, manifest)?)?;
        Ok(ArchiveIndex {
            descriptors,
            entries,
        })
    }

    /// Recover the descriptor graph; layer contents are read from this archive
    pub fn read(&self) -> Result<DescriptorGraph> {
        let index = self.scan()?;
        let mut layers: HashMap<ImageLayerDescriptor, Arc<dyn LayerContents>> = HashMap::new();
        for layer in index.distinct_layers() {
            let name = layer_entry_name(&layer.digest);
            let location = index.entries.get(&name).copied().ok_or_else(|| {
                RegistryError::Validation(format!(
                    "{} is missing layer entry {}",
                    self.path.display(),
                    name
                ))
            })?;
            layers.insert(
                layer,
                Arc::new(ArchiveLayer {
                    path: self.path.clone(),
                    location,
                }),
            );
        }

        self.logger.detail(&format!(
            "Read {} artifact(s) and {} layer(s) from {}",
            index.descriptors.len(),
            layers.len(),
            self.path.display()
        ));
        Ok(DescriptorGraph::from_parts(index.descriptors, layers))
    }

    /// Layers of this archive whose stored bytes hash to their digest
    pub async fn present_layers(&self) -> Result<Vec<ImageLayerDescriptor>> {
        let index = self.scan()?;
        let mut present = Vec::new();
        for layer in index.distinct_layers() {
            let Some(location) = index.entries.get(&layer_entry_name(&layer.digest)).copied() else {
                continue;
            };
            match read_entry(&self.path, location) {
                Ok(data) if layer.digest.matches(&data) => present.push(layer),
                Ok(_) => self
                    .logger
                    .warning(&format!("Layer {} in archive is corrupt", layer.digest)),
                Err(e) => self
                    .logger
                    .warning(&format!("Layer {} in archive is unreadable: {}", layer.digest, e)),
            }
        }
        Ok(present)
    }

    /// Write `graph` and all of its layers, reusing the layers of a previous
    /// archive at the same path when `resume` is set
    pub async fn write(&self, graph: &DescriptorGraph, resume: bool) -> Result<()> {
        let present = if resume && self.path.exists() {
            match self.present_layers().await {
                Ok(present) => {
                    self.logger.info(&format!(
                        "Resuming: {} layer(s) already present in {}",
                        present.len(),
                        self.path.display()
                    ));
                    present
                }
                Err(e) => {
                    self.logger.warning(&format!(
                        "Existing archive {} is not reusable, writing from scratch: {}",
                        self.path.display(),
                        e
                    ));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        self.write_with(graph, &present).await
    }

    /// Write `graph`, copying every layer in `already_present` from the
    /// existing archive instead of fetching it
    pub async fn write_with(
        &self,
        graph: &DescriptorGraph,
        already_present: &[ImageLayerDescriptor],
    ) -> Result<()> {
        let temp_path = self.temp_path();
        match self.write_to(&temp_path, graph, already_present).await {
            Ok(()) => {
                fs::rename(&temp_path, &self.path).map_err(|e| {
                    let _ = fs::remove_file(&temp_path);
                    RegistryError::Io(format!(
                        "Failed to move archive into place at {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                self.logger
                    .success(&format!("Archive written to {}", self.path.display()));
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "archive.tar".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
    }

    async fn write_to(
        &self,
        temp_path: &Path,
        graph: &DescriptorGraph,
        already_present: &[ImageLayerDescriptor],
    ) -> Result<()> {
        // One entry per digest, in digest order
        let layers: BTreeMap<Digest, ImageLayerDescriptor> = graph
            .layer_descriptors()
            .into_iter()
            .rev()
            .map(|layer| (layer.digest.clone(), layer))
            .collect();
        let present: HashSet<&Digest> = already_present.iter().map(|layer| &layer.digest).collect();
        let previous = if present.is_empty() {
            HashMap::new()
        } else {
            index_entries(&self.path)?
        };

        let file = File::create(temp_path).map_err(|e| {
            RegistryError::Io(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        append_entry(&mut builder, MANIFEST_ENTRY, &graph.as_bytes()?)?;

        let total = layers.len();
        let mut fetched = 0usize;
        let mut reused = 0usize;
        let mut pending = stream::iter(layers.into_values().map(|layer| {
            let reusable = if present.contains(&layer.digest) {
                previous.get(&layer_entry_name(&layer.digest)).copied()
            } else {
                None
            };
            async move {
                if let Some(location) = reusable {
                    match read_entry(&self.path, location) {
                        Ok(data) if layer.digest.matches(&data) => return Ok((layer, data, true)),
                        _ => self.logger.warning(&format!(
                            "Layer {} changed in the previous archive, fetching it again",
                            layer.digest
                        )),
                    }
                }
                let data = graph.find_layer(&layer)?.open().await?;
                layer
                    .digest
                    .verify(&data)
                    .map_err(|e| e.with_reference(layer.digest.to_string()))?;
                Ok::<_, RegistryError>((layer, data, false))
            }
        }))
        .buffered(self.concurrency);

        while let Some(result) = pending.next().await {
            let (layer, data, was_reused) = result?;
            append_entry(&mut builder, &layer_entry_name(&layer.digest), &data)?;
            if was_reused {
                reused += 1;
            } else {
                fetched += 1;
            }
            self.logger.detail(&format!(
                "[{}/{}] {} ({})",
                reused + fetched,
                total,
                layer.digest.short(),
                self.logger.format_size(data.len() as u64)
            ));
        }

        let mut writer = builder
            .into_inner()
            .map_err(|e| RegistryError::Io(format!("Failed to finish archive: {}", e)))?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| RegistryError::Io(format!("Failed to flush archive: {}", e)))?;
        file.sync_all()?;

        self.logger.info(&format!(
            "Archived {} layer(s): {} fetched, {} reused",
            total, fetched, reused
        ));
        Ok(())
    }
}
