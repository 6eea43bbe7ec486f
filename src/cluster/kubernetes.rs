//! Kubernetes implementation of the target cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams, Preconditions, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{ApiCapabilities, Scope, pinned_kind};
use kube::{Client, Config};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::api::{DISABLED_VALUE, PRUNE_ANNOTATION, ResourceRef};
use crate::error::ClusterError;
use crate::manifest::Manifest;

use super::{ClusterConnector, DeleteOutcome, Identity, TargetCluster};

/// Keys looked up in a kubeconfig secret, in order.
const KUBECONFIG_KEYS: &[&str] = &["value", "value.yaml"];

/// Poll period while waiting for a deleted object to disappear.
const RECREATE_POLL: Duration = Duration::from_millis(500);

/// Maximum wait for a deleted object to disappear.
const RECREATE_WAIT: Duration = Duration::from_secs(30);

/// A cluster reached with one set of credentials.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    resources: Arc<RwLock<HashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>>,
}

/// Where the API scope of a resource type stands.
enum Resolved {
    Found(Api<DynamicObject>),
    TypeMissing,
}

impl KubeCluster {
    /// Creates a handle applying with `field_manager`.
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn discover(
        &self,
        gvk: &GroupVersionKind,
    ) -> std::result::Result<(ApiResource, ApiCapabilities), kube::Error> {
        if let Some(found) = self.resources.read().await.get(gvk) {
            return Ok(found.clone());
        }
        let found = pinned_kind(&self.client, gvk).await?;
        self.resources.write().await.insert(gvk.clone(), found.clone());
        Ok(found)
    }

    /// Returns the API for an object, or `TypeMissing` when the cluster does not
    /// serve its type.
    async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        resource: &str,
    ) -> std::result::Result<Resolved, ClusterError> {
        let (ar, caps) = match self.discover(gvk).await {
            Ok(found) => found,
            Err(e) if is_type_missing(&e) => return Ok(Resolved::TypeMissing),
            Err(e) => return Err(map_error(resource, e)),
        };

        let api = if caps.scope == Scope::Namespaced {
            if namespace.is_empty() {
                return Err(ClusterError::api(resource, "namespace required for namespaced kind"));
            }
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(Resolved::Found(api))
    }

    fn gvk_of_ref(resource: &ResourceRef) -> GroupVersionKind {
        GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind)
    }

    fn gvk_of_manifest(manifest: &Manifest) -> GroupVersionKind {
        let r = manifest.resource_ref();
        Self::gvk_of_ref(&r)
    }

    async fn wait_gone(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        resource: &str,
    ) -> std::result::Result<(), ClusterError> {
        let deadline = tokio::time::Instant::now() + RECREATE_WAIT;
        loop {
            if api.get_opt(name).await.map_err(|e| map_error(resource, e))?.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::api(
                    resource,
                    "timed out waiting for deletion before recreate",
                ));
            }
            tokio::time::sleep(RECREATE_POLL).await;
        }
    }
}

#[async_trait]
impl TargetCluster for KubeCluster {
    async fn apply(&self, manifest: &Manifest) -> std::result::Result<ResourceRef, ClusterError> {
        let resource = manifest.to_string();
        let gvk = Self::gvk_of_manifest(manifest);
        let (ar, caps) = self.discover(&gvk).await.map_err(|e| map_error(&resource, e))?;

        let mut body = manifest.to_value();
        let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced {
            let namespace = manifest.namespace().ok_or_else(|| {
                ClusterError::api(&resource, "namespace required for namespaced kind")
            })?;
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            if let Some(Value::Object(metadata)) = body.get_mut("metadata") {
                metadata.remove("namespace");
            }
            Api::all_with(self.client.clone(), &ar)
        };

        let params = PatchParams::apply(&self.field_manager).force();
        let applied = api
            .patch(manifest.name(), &params, &Patch::Apply(&body))
            .await
            .map_err(|e| map_error(&resource, e))?;

        debug!(resource = %resource, "Applied");
        Ok(ResourceRef::new(
            manifest.api_version(),
            manifest.kind(),
            applied.metadata.namespace.as_deref().unwrap_or_default(),
            manifest.name(),
        ))
    }

    async fn recreate(
        &self,
        manifest: &Manifest,
    ) -> std::result::Result<ResourceRef, ClusterError> {
        let resource = manifest.to_string();
        let target = manifest.resource_ref();
        let gvk = Self::gvk_of_ref(&target);

        if let Resolved::Found(api) = self.api_for(&gvk, &target.namespace, &resource).await? {
            let params = DeleteParams {
                propagation_policy: Some(PropagationPolicy::Foreground),
                ..DeleteParams::default()
            };
            match api.delete(manifest.name(), &params).await {
                Ok(_) => {}
                Err(e) => {
                    let mapped = map_error(&resource, e);
                    if !mapped.is_not_found() {
                        return Err(mapped);
                    }
                }
            }
            self.wait_gone(&api, manifest.name(), &resource).await?;
            info!(resource = %resource, "Deleted for recreate");
        }

        self.apply(manifest).await
    }

    async fn delete(
        &self,
        resource: &ResourceRef,
        honor_opt_out: bool,
    ) -> std::result::Result<DeleteOutcome, ClusterError> {
        let label = resource.to_string();
        let gvk = Self::gvk_of_ref(resource);
        let api = match self.api_for(&gvk, &resource.namespace, &label).await? {
            Resolved::Found(api) => api,
            Resolved::TypeMissing => return Ok(DeleteOutcome::NotFound),
        };

        let Some(live) = api.get_opt(&resource.name).await.map_err(|e| map_error(&label, e))? else {
            return Ok(DeleteOutcome::NotFound);
        };

        let opted_out = live
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PRUNE_ANNOTATION))
            .is_some_and(|v| v == DISABLED_VALUE);
        if honor_opt_out && opted_out {
            debug!(resource = %label, "Prune disabled by annotation");
            return Ok(DeleteOutcome::Skipped);
        }

        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: live.metadata.uid.clone(),
                resource_version: live.metadata.resource_version.clone(),
            }),
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        match api.delete(&resource.name, &params).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) => {
                let mapped = map_error(&label, e);
                if mapped.is_not_found() {
                    Ok(DeleteOutcome::NotFound)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn exists(&self, resource: &ResourceRef) -> std::result::Result<bool, ClusterError> {
        let label = resource.to_string();
        let gvk = Self::gvk_of_ref(resource);
        match self.api_for(&gvk, &resource.namespace, &label).await? {
            Resolved::Found(api) => Ok(api
                .get_opt(&resource.name)
                .await
                .map_err(|e| map_error(&label, e))?
                .is_some()),
            Resolved::TypeMissing => Ok(false),
        }
    }
}

/// Builds cluster handles for each identity.
#[derive(Clone)]
pub struct KubeClusterConnector {
    client: Client,
    field_manager: String,
    controller: KubeCluster,
}

impl KubeClusterConnector {
    /// Creates a connector using `client` as the controller identity.
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        let field_manager = field_manager.into();
        Self {
            controller: KubeCluster::new(client.clone(), field_manager.clone()),
            client,
            field_manager,
        }
    }

    async fn kubeconfig_client(
        &self,
        namespace: &str,
        secret: &str,
    ) -> std::result::Result<Client, String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(secret).await.map_err(|e| e.to_string())?;
        let data = secret.data.unwrap_or_default();

        let raw = KUBECONFIG_KEYS
            .iter()
            .find_map(|key| data.get(*key))
            .ok_or_else(|| format!("secret has none of the keys {KUBECONFIG_KEYS:?}"))?;
        let yaml =
            std::str::from_utf8(&raw.0).map_err(|e| format!("kubeconfig is not UTF-8: {e}"))?;

        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| e.to_string())?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| e.to_string())?;
        Client::try_from(config).map_err(|e| e.to_string())
    }

    async fn impersonating_client(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Client, String> {
        let mut config = Config::infer().await.map_err(|e| e.to_string())?;
        config.auth_info.impersonate = Some(format!("system:serviceaccount:{namespace}:{name}"));
        Client::try_from(config).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ClusterConnector for KubeClusterConnector {
    async fn connect(
        &self,
        identity: &Identity,
    ) -> std::result::Result<Arc<dyn TargetCluster>, ClusterError> {
        let client = match identity {
            Identity::Controller => return Ok(Arc::new(self.controller.clone())),
            Identity::ServiceAccount { namespace, name } => {
                self.impersonating_client(namespace, name).await
            }
            Identity::KubeConfig { namespace, secret } => {
                self.kubeconfig_client(namespace, secret).await
            }
        }
        .map_err(|message| ClusterError::Client {
            identity: identity.to_string(),
            message,
        })?;

        debug!("Connected as {identity}");
        Ok(Arc::new(KubeCluster::new(client, self.field_manager.clone())))
    }
}

/// Returns true when the error means the resource type is not served.
fn is_type_missing(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => response.code == 404,
        kube::Error::Discovery(_) => true,
        _ => false,
    }
}

/// Returns true when the server rejected a change to an immutable field.
fn is_immutable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("immutable") || lower.contains("forbidden: updates to")
}

/// Classifies an API error.
fn map_error(resource: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ClusterError::NotFound {
                resource: resource.to_string(),
            },
            409 => ClusterError::Conflict {
                resource: resource.to_string(),
                message: response.message,
            },
            422 if is_immutable_message(&response.message) => ClusterError::ImmutableField {
                resource: resource.to_string(),
                message: response.message,
            },
            _ => ClusterError::api(resource, response.message),
        },
        other => ClusterError::api(resource, other.to_string()),
    }
}
