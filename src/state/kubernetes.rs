//! Kubernetes-backed instance store.
//!
//! Instances are read as dynamic objects of the `CueInstance` custom resource;
//! status is written through the status subresource.

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{CueInstance, CueInstanceStatus, FINALIZER, GROUP, InstanceKey, KIND, VERSION};
use crate::error::{ControllerError, Result, StateError};

use super::store::InstanceStore;

/// Plural resource name of `CueInstance`.
const PLURAL: &str = "cueinstances";

/// Instance store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeInstanceStore {
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
}

impl KubeInstanceStore {
    /// Creates a store over all namespaces, or only `namespace` when set.
    #[must_use]
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            resource: instance_resource(),
            namespace,
        }
    }

    /// Returns the API covering every instance the store serves.
    #[must_use]
    pub fn list_api(&self) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

/// Returns the API resource of `CueInstance`.
#[must_use]
pub fn instance_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(GROUP, VERSION, KIND);
    ApiResource::from_gvk_with_plural(&gvk, PLURAL)
}

/// Decodes a dynamic object into a `CueInstance`.
///
/// # Errors
///
/// Returns an error when the object does not match the `CueInstance` schema.
pub fn decode_instance(object: &DynamicObject) -> std::result::Result<CueInstance, StateError> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| StateError::corrupted(format!("{}: {e}", object_name(object))))
}

fn object_name(object: &DynamicObject) -> String {
    format!(
        "{}/{}",
        object.metadata.namespace.as_deref().unwrap_or_default(),
        object.metadata.name.as_deref().unwrap_or_default()
    )
}

fn api_error(err: &kube::Error) -> ControllerError {
    ControllerError::State(StateError::Api {
        message: err.to_string(),
    })
}

#[async_trait]
impl InstanceStore for KubeInstanceStore {
    async fn list(&self) -> Result<Vec<CueInstance>> {
        let objects = self
            .list_api()
            .list(&ListParams::default())
            .await
            .map_err(|e| api_error(&e))?;

        let mut instances = Vec::with_capacity(objects.items.len());
        for object in &objects.items {
            match decode_instance(object) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping undecodable CueInstance: {e}"),
            }
        }
        debug!("Listed {} instances", instances.len());
        Ok(instances)
    }

    async fn get(&self, key: &InstanceKey) -> Result<Option<CueInstance>> {
        let Some(object) = self
            .api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| api_error(&e))?
        else {
            return Ok(None);
        };

        Ok(Some(decode_instance(&object)?))
    }

    async fn patch_status(&self, key: &InstanceKey, status: &CueInstanceStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(&e))?;
        debug!(instance = %key, "Status patched");
        Ok(())
    }

    async fn set_finalizer(&self, key: &InstanceKey, present: bool) -> Result<()> {
        let api = self.api(&key.namespace);
        let Some(object) = api.get_opt(&key.name).await.map_err(|e| api_error(&e))? else {
            return Err(StateError::NotFound { key: key.to_string() }.into());
        };

        let mut finalizers = object.metadata.finalizers.clone().unwrap_or_default();
        let has = finalizers.iter().any(|f| f == FINALIZER);
        if present == has {
            return Ok(());
        }
        if present {
            finalizers.push(String::from(FINALIZER));
        } else {
            finalizers.retain(|f| f != FINALIZER);
        }

        // resourceVersion turns the merge patch into a compare-and-swap.
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": object.metadata.resource_version,
            }
        });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error(&e))?;
        debug!(instance = %key, present, "Finalizer updated");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "kubernetes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(spec: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": format!("{GROUP}/{VERSION}"),
            "kind": KIND,
            "metadata": { "name": "app", "namespace": "apps", "generation": 3 },
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn test_instance_resource() {
        let resource = instance_resource();
        assert_eq!(resource.plural, "cueinstances");
        assert_eq!(resource.kind, KIND);
        assert_eq!(resource.group, GROUP);
    }

    #[test]
    fn test_decode_instance() {
        let instance = decode_instance(&object(json!({
            "interval": "5m",
            "sourceRef": { "kind": "GitRepository", "name": "repo" },
        })))
        .unwrap();
        assert_eq!(instance.key(), InstanceKey::new("apps", "app"));
        assert_eq!(instance.metadata.generation, 3);
    }

    #[test]
    fn test_decode_rejects_missing_source() {
        let err = decode_instance(&object(json!({ "interval": "5m" }))).unwrap_err();
        assert!(err.to_string().contains("apps/app"));
    }
}
