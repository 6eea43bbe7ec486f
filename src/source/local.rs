//! A directory on disk used in place of a source object.

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};

use crate::api::SourceReference;
use crate::error::SourceError;

use super::{Artifact, SourceResolver};

/// Serves one local directory for every source reference.
///
/// The revision is derived from the content so that unchanged trees keep the
/// same revision across cycles.
#[derive(Debug, Clone)]
pub struct LocalSourceResolver {
    dir: PathBuf,
}

impl LocalSourceResolver {
    /// Creates a resolver serving `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Hashes relative paths and contents of every regular file below `root`, in path order.
fn tree_digest(root: &Path) -> std::io::Result<String> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let relative = file.strip_prefix(root).unwrap_or(&file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(std::fs::read(&file)?);
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl SourceResolver for LocalSourceResolver {
    async fn resolve(
        &self,
        _namespace: &str,
        source: &SourceReference,
    ) -> std::result::Result<Artifact, SourceError> {
        if !self.dir.is_dir() {
            return Err(SourceError::NotFound {
                reference: format!("{source} ({})", self.dir.display()),
            });
        }

        let dir = self.dir.clone();
        let digest = tokio::task::spawn_blocking(move || tree_digest(&dir))
            .await
            .map_err(|e| SourceError::fetch(self.dir.display().to_string(), e.to_string()))?
            .map_err(|e| SourceError::fetch(self.dir.display().to_string(), e.to_string()))?;

        Ok(Artifact {
            path: self.dir.clone(),
            revision: format!("local@sha256:{digest}"),
            digest: format!("sha256:{digest}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> SourceReference {
        SourceReference {
            api_version: None,
            kind: String::from("GitRepository"),
            name: String::from("app"),
            namespace: None,
        }
    }

    #[tokio::test]
    async fn test_revision_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.cue"), "package main\n").unwrap();
        let resolver = LocalSourceResolver::new(dir.path());

        let first = resolver.resolve("default", &reference()).await.unwrap();
        let second = resolver.resolve("default", &reference()).await.unwrap();
        assert_eq!(first.revision, second.revision);

        std::fs::write(dir.path().join("main.cue"), "package main\nx: 1\n").unwrap();
        let third = resolver.resolve("default", &reference()).await.unwrap();
        assert_ne!(first.revision, third.revision);
        assert!(third.revision.starts_with("local@sha256:"));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let resolver = LocalSourceResolver::new("/nonexistent/source");
        let err = resolver.resolve("default", &reference()).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }
}
