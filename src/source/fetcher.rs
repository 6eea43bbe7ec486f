//! Artifact download, verification and extraction.
//!
//! Artifacts are gzip tarballs served by the source controller. Each verified
//! artifact is extracted once into a directory named after its digest and reused
//! by later cycles. Extractions are grouped per source; a new revision of a
//! source replaces the older ones.

use reqwest::{Client, StatusCode, Url};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::SourceError;

use super::Artifact;

/// Maximum number of attempts for transient download failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 500;

/// Marker written once an extraction completed.
const COMPLETE_MARKER: &str = ".complete";

/// An expected content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    /// Algorithm name: `sha256`, `sha384` or `sha512`.
    pub algorithm: String,
    /// Lowercase hex encoding.
    pub hex: String,
}

impl Digest {
    /// Parses `algo:hex`, or a bare hex string taken as SHA-256.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for unknown algorithms or non-hex values.
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let (algorithm, hex) = value.split_once(':').unwrap_or(("sha256", value));
        let algorithm = algorithm.to_ascii_lowercase();
        if !matches!(algorithm.as_str(), "sha256" | "sha384" | "sha512") {
            return Err(format!("unsupported digest algorithm '{algorithm}'"));
        }
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid digest '{value}'"));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Computes the digest of `data` with this digest's algorithm.
    #[must_use]
    pub fn compute(&self, data: &[u8]) -> String {
        match self.algorithm.as_str() {
            "sha384" => hex::encode(Sha384::digest(data)),
            "sha512" => hex::encode(Sha512::digest(data)),
            _ => hex::encode(Sha256::digest(data)),
        }
    }

    /// Returns true when `data` matches.
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        self.compute(data) == self.hex
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Downloads and caches artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    /// HTTP client.
    client: Client,
    /// Root of the extraction cache.
    cache_dir: PathBuf,
    /// Replacement for the artifact URL host, `host[:port]`.
    source_host: Option<String>,
}

impl ArtifactFetcher {
    /// Creates a fetcher with the given download timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> std::result::Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::fetch("", format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            source_host: None,
        })
    }

    /// Rewrites artifact URLs to the given host.
    #[must_use]
    pub fn with_source_host(mut self, host: Option<String>) -> Self {
        self.source_host = host.filter(|h| !h.is_empty());
        self
    }

    /// Fetches, verifies and extracts an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::FetchFailed`] on download failure, digest mismatch or
    /// extraction failure.
    pub async fn fetch(
        &self,
        url: &str,
        revision: &str,
        digest: &str,
    ) -> std::result::Result<Artifact, SourceError> {
        let expected = Digest::parse(digest).map_err(|e| SourceError::fetch(url, e))?;
        let url = self.rewrite_url(url)?;
        let source_dir = self.cache_dir.join(source_key(&url));
        let target = source_dir.join(format!("{}-{}", expected.algorithm, expected.hex));

        if target.join(COMPLETE_MARKER).exists() {
            debug!("Reusing cached artifact {}", target.display());
            return Ok(Artifact {
                path: target,
                revision: revision.to_string(),
                digest: expected.to_string(),
            });
        }

        info!(revision, "Downloading artifact from {url}");
        let data = self.download(&url).await?;

        if !expected.verify(&data) {
            let actual = format!("{}:{}", expected.algorithm, expected.compute(&data));
            return Err(SourceError::fetch(
                url.as_str(),
                format!("digest mismatch: expected {expected}, got {actual}"),
            ));
        }

        let staging = self
            .cache_dir
            .join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
        let staged = staging.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_tarball(&data, &staged))
            .await
            .map_err(|e| format!("extraction task failed: {e}"))
            .and_then(|r| r);

        if let Err(e) = extracted {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(SourceError::fetch(url.as_str(), e));
        }

        if let Err(e) = finalize(&staging, &target).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(SourceError::fetch(url.as_str(), e));
        }

        debug!("Artifact extracted to {}", target.display());
        remove_superseded(&source_dir, &target).await;
        Ok(Artifact {
            path: target,
            revision: revision.to_string(),
            digest: expected.to_string(),
        })
    }

    fn rewrite_url(&self, raw: &str) -> std::result::Result<Url, SourceError> {
        let mut url =
            Url::parse(raw).map_err(|e| SourceError::fetch(raw, format!("invalid URL: {e}")))?;
        if let Some(host) = &self.source_host {
            let invalid = |detail: String| {
                SourceError::fetch(raw, format!("invalid source host '{host}'{detail}"))
            };
            let (hostname, port) = match host.rsplit_once(':') {
                Some((name, port)) => {
                    let port: u16 = port.parse().map_err(|_| invalid(String::new()))?;
                    (name, Some(port))
                }
                None => (host.as_str(), None),
            };
            url.set_host(Some(hostname)).map_err(|e| invalid(format!(": {e}")))?;
            url.set_port(port).map_err(|()| invalid(String::new()))?;
        }
        Ok(url)
    }

    async fn download(&self, url: &Url) -> std::result::Result<Vec<u8>, SourceError> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES}");
                let delay = Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt));
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    let bytes = response.bytes().await.map_err(|e| {
                        SourceError::fetch(url.as_str(), format!("failed to read body: {e}"))
                    })?;
                    trace!("Downloaded {} bytes", bytes.len());
                    return Ok(bytes.to_vec());
                }
                Ok(response) => {
                    let status = response.status();
                    last_error = format!("unexpected status {status}");
                    if !is_transient(status) {
                        break;
                    }
                }
                Err(e) => {
                    last_error = format!("request failed: {e}");
                }
            }
        }

        Err(SourceError::fetch(url.as_str(), last_error))
    }
}

/// Cache subdirectory of the source serving `url`.
///
/// Artifact file names change with every revision, so the key covers the path
/// without its last segment.
fn source_key(url: &Url) -> String {
    let path = url.path();
    let parent = path.rsplit_once('/').map_or(path, |(parent, _)| parent);
    let hash = hex::encode(Sha256::digest(parent.as_bytes()));
    hash[..16].to_string()
}

/// Removes completed extractions of a source other than `current`.
async fn remove_superseded(source_dir: &Path, current: &Path) {
    let mut entries = match tokio::fs::read_dir(source_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list {}: {e}", source_dir.display());
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == current || !path.join(COMPLETE_MARKER).exists() {
            continue;
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!("Removed superseded artifact {}", path.display()),
            Err(e) => warn!("Failed to remove {}: {e}", path.display()),
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status.as_u16() == 429
}

/// Unpacks a gzip tarball into `dir`.
fn extract_tarball(data: &[u8], dir: &Path) -> std::result::Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
    let decoder = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(false);
    archive
        .unpack(dir)
        .map_err(|e| format!("failed to extract tarball: {e}"))
}

/// Moves a fully extracted staging directory into place and marks it complete.
async fn finalize(staging: &Path, target: &Path) -> std::result::Result<(), String> {
    tokio::fs::write(staging.join(COMPLETE_MARKER), b"")
        .await
        .map_err(|e| format!("failed to write marker: {e}"))?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }
    if target.exists() {
        tokio::fs::remove_dir_all(target)
            .await
            .map_err(|e| format!("failed to clear {}: {e}", target.display()))?;
    }
    tokio::fs::rename(staging, target)
        .await
        .map_err(|e| format!("failed to move artifact into {}: {e}", target.display()))
}

#[cfg(test)]
pub(crate) fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
