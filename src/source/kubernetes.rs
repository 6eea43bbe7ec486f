//! Flux source objects as artifact providers.

use async_trait::async_trait;
use kube::api::Api;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::pinned_kind;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use crate::api::SourceReference;
use crate::error::SourceError;

use super::{Artifact, ArtifactFetcher, SourceResolver};

/// Resolves `GitRepository`, `OCIRepository`, `Bucket` and any other kind that
/// publishes `status.artifact`.
#[derive(Clone)]
pub struct KubeSourceResolver {
    client: Client,
    fetcher: ArtifactFetcher,
}

/// The artifact advertised in a source status.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AdvertisedArtifact {
    url: String,
    revision: String,
    digest: String,
}

impl KubeSourceResolver {
    /// Creates a resolver.
    #[must_use]
    pub const fn new(client: Client, fetcher: ArtifactFetcher) -> Self {
        Self { client, fetcher }
    }
}

/// Reads `status.artifact` from a source object.
fn advertised_artifact(
    object: &Value,
    reference: &str,
) -> std::result::Result<AdvertisedArtifact, SourceError> {
    let status = object.get("status");
    let Some(artifact) = status.and_then(|s| s.get("artifact")) else {
        let message = status
            .and_then(|s| s.get("conditions"))
            .and_then(Value::as_array)
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
            })
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("artifact not available yet");
        return Err(SourceError::NotReady {
            reference: reference.to_string(),
            message: message.to_string(),
        });
    };

    let field = |name: &str| artifact.get(name).and_then(Value::as_str).filter(|s| !s.is_empty());

    let url = field("url").ok_or_else(|| SourceError::NotReady {
        reference: reference.to_string(),
        message: String::from("artifact has no URL"),
    })?;
    let digest = field("digest").or_else(|| field("checksum")).ok_or_else(|| SourceError::NotReady {
        reference: reference.to_string(),
        message: String::from("artifact has no digest"),
    })?;

    Ok(AdvertisedArtifact {
        url: url.to_string(),
        revision: field("revision").unwrap_or_default().to_string(),
        digest: digest.to_string(),
    })
}

#[async_trait]
impl SourceResolver for KubeSourceResolver {
    async fn resolve(
        &self,
        namespace: &str,
        source: &SourceReference,
    ) -> std::result::Result<Artifact, SourceError> {
        let namespace = source.namespace_or(namespace);
        let reference = format!("{}/{}/{}", source.kind, namespace, source.name);

        let (group, version) = source
            .api_version()
            .split_once('/')
            .unwrap_or(("", source.api_version()));
        let gvk = GroupVersionKind::gvk(group, version, &source.kind);

        let (resource, _caps) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| SourceError::NotFound {
                reference: format!("{reference} ({e})"),
            })?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let object = api
            .get_opt(&source.name)
            .await
            .map_err(|e| SourceError::fetch(&reference, e.to_string()))?
            .ok_or_else(|| SourceError::NotFound {
                reference: reference.clone(),
            })?;
        let value = serde_json::to_value(&object)
            .map_err(|e| SourceError::fetch(&reference, e.to_string()))?;

        let advertised = advertised_artifact(&value, &reference)?;
        debug!(source = %reference, revision = %advertised.revision, "Resolved source artifact");

        self.fetcher
            .fetch(&advertised.url, &advertised.revision, &advertised.digest)
            .await
    }
}
