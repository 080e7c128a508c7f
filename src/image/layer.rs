//! Layer content location
//!
//! A descriptor graph knows which layers exist; a [`LayerContents`] knows where
//! the bytes of one layer currently live. Graphs built from a registry hold
//! [`RegistryLayer`]s, graphs read from an archive hold archive entries.

use crate::error::Result;
use crate::image::digest::Digest;
use crate::image::reference::Repository;
use crate::logging::Logger;
use crate::registry::{Registry, RetryPolicy};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fmt;
use std::sync::Arc;

/// Opens the (compressed) bytes of one layer
#[async_trait]
pub trait LayerContents: Send + Sync + fmt::Debug {
    async fn open(&self) -> Result<Vec<u8>>;
}

/// Layer bytes served by a registry blob endpoint
pub struct RegistryLayer {
    registry: Arc<dyn Registry>,
    repository: Repository,
    digest: Digest,
    retry: RetryPolicy,
    logger: Logger,
}

impl RegistryLayer {
    pub fn new(
        registry: Arc<dyn Registry>,
        repository: Repository,
        digest: Digest,
        retry: RetryPolicy,
        logger: Logger,
    ) -> Self {
        Self {
            registry,
            repository,
            digest,
            retry,
            logger,
        }
    }
}

impl fmt::Debug for RegistryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLayer")
            .field("repository", &self.repository.to_string())
            .field("digest", &self.digest.to_string())
            .finish()
    }
}

#[async_trait]
impl LayerContents for RegistryLayer {
    async fn open(&self) -> Result<Vec<u8>> {
        let description = format!("Fetching layer {}", self.digest.short());
        self.retry
            .run(&self.logger, &description, || {
                self.registry.blob(&self.repository, &self.digest)
            })
            .await
            .map_err(|e| e.with_reference(self.repository.digest(&self.digest).to_string()))
    }
}

/// Layer bytes already held in memory
#[derive(Clone)]
pub struct InMemoryLayer {
    data: Arc<Vec<u8>>,
}

impl InMemoryLayer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }
}

impl fmt::Debug for InMemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLayer")
            .field("len", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl LayerContents for InMemoryLayer {
    async fn open(&self) -> Result<Vec<u8>> {
        Ok(self.data.as_ref().clone())
    }
}

/// Digest of the decompressed content of a gzip layer
pub fn compute_diff_id(compressed: &[u8]) -> Result<Digest> {
    Digest::sha256_reader(GzDecoder::new(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_compute_diff_id() {
        let raw = b"layer contents".to_vec();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(compute_diff_id(&compressed).unwrap(), Digest::sha256(&raw));
        assert!(compute_diff_id(b"not gzip").is_err());
    }

    #[tokio::test]
    async fn test_in_memory_layer() {
        let layer = InMemoryLayer::new(vec![1, 2, 3]);
        assert_eq!(layer.open().await.unwrap(), vec![1, 2, 3]);
    }
}
