//! Image model
//!
//! Types for naming, describing and locating the content of OCI and Docker
//! images and indexes:
//!
//! - [`reference`]: registry/repository/tag/digest references and their metadata
//! - [`manifest`]: media types and the manifest and config JSON documents
//! - [`descriptor`]: the resolved, serializable descriptor tree
//! - [`graph`]: building a descriptor graph from a registry
//! - [`layer`]: where the bytes of a layer live
//! - [`tag`]: upload tags derived from digests

pub mod descriptor;
pub mod digest;
pub mod graph;
pub mod layer;
pub mod manifest;
pub mod reference;
pub mod tag;

pub use descriptor::{
    ImageDescriptor, ImageIndexDescriptor, ImageLayerDescriptor, ImageOrImageIndexDescriptor,
};
pub use digest::Digest;
pub use graph::DescriptorGraph;
pub use layer::LayerContents;
pub use reference::{ImageReference, Metadata, Repository};
pub use tag::{DefaultTagGenerator, DigestWrap, RepoBasedTagGenerator, TagGenerator, TagStrategy};
