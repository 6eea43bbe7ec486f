//! Source resolution.
//!
//! This module turns a `sourceRef` into a verified local artifact tree:
//! - [`KubeSourceResolver`] reads Flux source objects and downloads their artifact
//! - [`ArtifactFetcher`] downloads, verifies and extracts tarballs into a cache
//! - [`LocalSourceResolver`] serves a directory on disk for local runs

mod fetcher;
mod kubernetes;
mod local;

use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(test)]
use mockall::automock;

use crate::api::SourceReference;
use crate::error::SourceError;

pub use fetcher::{ArtifactFetcher, Digest};
pub use kubernetes::KubeSourceResolver;
pub use local::LocalSourceResolver;

/// A resolved, verified artifact extracted on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Root of the extracted tree.
    pub path: PathBuf,
    /// Source revision, e.g. `main@sha1:0a1b2c`.
    pub revision: String,
    /// Content digest, e.g. `sha256:<hex>`.
    pub digest: String,
}

/// Resolves source references to artifacts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolves `source` for an instance living in `namespace`.
    async fn resolve(
        &self,
        namespace: &str,
        source: &SourceReference,
    ) -> std::result::Result<Artifact, SourceError>;
}
