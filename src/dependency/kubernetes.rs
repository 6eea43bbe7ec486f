//! Dependency readiness read from the Kubernetes API.

use async_trait::async_trait;
use kube::api::Api;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::pinned_kind;
use kube::Client;

use super::{readiness_of, DependencyTarget, Readiness, ReadinessProbe};

/// Reads any kind that reports a `Ready` condition.
#[derive(Clone)]
pub struct KubeReadinessProbe {
    client: Client,
}

impl KubeReadinessProbe {
    /// Creates a probe.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for KubeReadinessProbe {
    async fn probe(&self, target: &DependencyTarget) -> std::result::Result<Readiness, String> {
        let (group, version) = target
            .api_version
            .split_once('/')
            .unwrap_or(("", target.api_version.as_str()));
        let gvk = GroupVersionKind::gvk(group, version, &target.kind);

        let (resource, _caps) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| format!("unknown kind {}: {e}", target.kind))?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &target.namespace, &resource);

        let Some(object) = api.get_opt(&target.name).await.map_err(|e| e.to_string())? else {
            return Ok(Readiness::NotFound);
        };
        let value = serde_json::to_value(&object).map_err(|e| e.to_string())?;
        Ok(readiness_of(&value))
    }
}
