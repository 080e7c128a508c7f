//! Image Relocator Library
//!
//! Copies OCI images and image indexes between registries, or through a tar
//! archive, keeping every manifest digest intact and verifying the result.

pub mod archive;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod image;
pub mod imageset;
pub mod logging;
pub mod registry;

pub use archive::TarArchive;
pub use config::RelocateConfig;
pub use error::{RegistryError, Result};
pub use image::{DescriptorGraph, Digest, ImageReference, Repository};
pub use imageset::{ImageSet, ProcessedImage, ProcessedImages, UnprocessedImageRef, UnprocessedImageRefs};
pub use logging::Logger;
pub use registry::{Credentials, Registry, RegistryClient, RegistryClientBuilder, RetryPolicy};
