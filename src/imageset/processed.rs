//! Result aggregation
//!
//! Concurrent units record their inputs and outputs here. Both collections are
//! keyed by content identity (last write wins) and read back sorted, so callers
//! see the same order no matter how work was scheduled.

use crate::error::{RegistryError, Result};
use crate::image::descriptor::{ImageDescriptor, ImageIndexDescriptor};
use crate::image::reference::ImageReference;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// An artifact still to be copied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessedImageRef {
    pub digest_ref: String,
    pub tag: String,
    pub labels: BTreeMap<String, String>,
    pub orig_ref: String,
}

impl UnprocessedImageRef {
    pub fn new(digest_ref: impl Into<String>, tag: impl Into<String>, orig_ref: impl Into<String>) -> Self {
        Self {
            digest_ref: digest_ref.into(),
            tag: tag.into(),
            labels: BTreeMap::new(),
            orig_ref: orig_ref.into(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub(crate) fn key(&self) -> String {
        format!("{}:{}", self.digest_ref, self.tag)
    }

    /// `digest_ref` is produced by digest resolution; anything else is a bug
    pub fn validate(&self) -> Result<()> {
        self.reference().map(|_| ())
    }

    pub fn reference(&self) -> Result<ImageReference> {
        ImageReference::parse_digest(&self.digest_ref).map_err(|e| {
            RegistryError::Internal(format!(
                "Expected {} to be a digest reference: {}",
                self.digest_ref, e
            ))
        })
    }
}

#[derive(Debug, Default)]
pub struct UnprocessedImageRefs {
    refs: Mutex<HashMap<String, UnprocessedImageRef>>,
}

impl UnprocessedImageRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, image_ref: UnprocessedImageRef) -> Result<()> {
        image_ref.validate()?;
        let mut refs = self.refs.lock().map_err(|_| {
            RegistryError::Internal("Unprocessed image map lock poisoned".to_string())
        })?;
        refs.insert(image_ref.key(), image_ref);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.refs.lock().map(|refs| refs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot ordered by digest reference, then tag
    pub fn all(&self) -> Result<Vec<UnprocessedImageRef>> {
        let refs = self.refs.lock().map_err(|_| {
            RegistryError::Internal("Unprocessed image map lock poisoned".to_string())
        })?;
        let mut all: Vec<_> = refs.values().cloned().collect();
        all.sort_by(|a, b| (&a.digest_ref, &a.tag).cmp(&(&b.digest_ref, &b.tag)));
        Ok(all)
    }
}

/// An artifact that was copied and verified at its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    pub unprocessed_image_ref: UnprocessedImageRef,
    /// Digest reference in the destination repository
    pub digest_ref: String,
    pub image: Option<ImageDescriptor>,
    pub image_index: Option<ImageIndexDescriptor>,
}

impl ProcessedImage {
    pub fn validate(&self) -> Result<()> {
        ImageReference::parse_digest(&self.digest_ref).map_err(|e| {
            RegistryError::Internal(format!(
                "Expected {} to be a digest reference: {}",
                self.digest_ref, e
            ))
        })?;
        match (&self.image, &self.image_index) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(RegistryError::Internal(format!(
                "Processed image {} must hold exactly one of an image or an index",
                self.digest_ref
            ))),
        }
    }

    /// Keyed by source, so two sources landing on one destination digest
    /// are both kept
    fn key(&self) -> String {
        self.unprocessed_image_ref.key()
    }
}

#[derive(Debug, Default)]
pub struct ProcessedImages {
    images: Mutex<HashMap<String, ProcessedImage>>,
}

impl ProcessedImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, image: ProcessedImage) -> Result<()> {
        image.validate()?;
        let mut images = self.images.lock().map_err(|_| {
            RegistryError::Internal("Processed image map lock poisoned".to_string())
        })?;
        images.insert(image.key(), image);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.images.lock().map(|images| images.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot ordered by source digest reference, then tag
    pub fn all(&self) -> Result<Vec<ProcessedImage>> {
        let images = self.images.lock().map_err(|_| {
            RegistryError::Internal("Processed image map lock poisoned".to_string())
        })?;
        let mut all: Vec<_> = images.values().cloned().collect();
        all.sort_by(|a, b| {
            let left = &a.unprocessed_image_ref;
            let right = &b.unprocessed_image_ref;
            (&left.digest_ref, &left.tag, &a.digest_ref).cmp(&(&right.digest_ref, &right.tag, &b.digest_ref))
        });
        Ok(all)
    }
}
