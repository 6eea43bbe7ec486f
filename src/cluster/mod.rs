//! Target cluster access.
//!
//! This module abstracts the cluster objects are applied to:
//! - [`TargetCluster`]: apply, recreate, delete and existence checks
//! - [`ClusterConnector`]: a [`TargetCluster`] per acting [`Identity`]
//! - Kubernetes implementations backed by `kube`

mod kubernetes;

use async_trait::async_trait;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::api::{CueInstance, ResourceRef};
use crate::error::ClusterError;
use crate::manifest::Manifest;

pub use kubernetes::{KubeCluster, KubeClusterConnector};

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object was deleted.
    Deleted,
    /// The object (or its type) did not exist.
    NotFound,
    /// The object opted out of pruning and was left in place.
    Skipped,
}

/// Operations on the target cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetCluster: Send + Sync {
    /// Server-side applies a manifest and returns the reference of the live object.
    async fn apply(&self, manifest: &Manifest) -> std::result::Result<ResourceRef, ClusterError>;

    /// Deletes the live object, waits for it to disappear, then applies the manifest.
    async fn recreate(&self, manifest: &Manifest) -> std::result::Result<ResourceRef, ClusterError>;

    /// Deletes an object with its current uid/resourceVersion as preconditions.
    ///
    /// With `honor_opt_out`, objects annotated with the prune opt-out are skipped.
    async fn delete(
        &self,
        resource: &ResourceRef,
        honor_opt_out: bool,
    ) -> std::result::Result<DeleteOutcome, ClusterError>;

    /// Returns true when the object exists.
    async fn exists(&self, resource: &ResourceRef) -> std::result::Result<bool, ClusterError>;
}

/// Identity objects are applied as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The controller's own credentials.
    Controller,
    /// Impersonation of a service account.
    ServiceAccount {
        /// Namespace of the service account.
        namespace: String,
        /// Name of the service account.
        name: String,
    },
    /// A kubeconfig stored in a secret, usually for a remote cluster.
    KubeConfig {
        /// Namespace of the secret.
        namespace: String,
        /// Name of the secret.
        secret: String,
    },
}

impl Identity {
    /// Selects the identity of an instance: kubeconfig, then service account,
    /// then the controller.
    #[must_use]
    pub fn for_instance(instance: &CueInstance) -> Self {
        let namespace = instance.metadata.namespace.clone();
        if let Some(kube_config) = &instance.spec.kube_config {
            return Self::KubeConfig {
                namespace,
                secret: kube_config.secret_ref.name.clone(),
            };
        }
        match instance.spec.service_account_name.as_deref() {
            Some(name) if !name.is_empty() => Self::ServiceAccount {
                namespace,
                name: name.to_string(),
            },
            _ => Self::Controller,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => f.write_str("controller identity"),
            Self::ServiceAccount { namespace, name } => {
                write!(f, "system:serviceaccount:{namespace}:{name}")
            }
            Self::KubeConfig { namespace, secret } => {
                write!(f, "kubeconfig secret {namespace}/{secret}")
            }
        }
    }
}

/// Produces cluster handles per identity.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Returns a cluster handle acting as `identity`.
    async fn connect(
        &self,
        identity: &Identity,
    ) -> std::result::Result<Arc<dyn TargetCluster>, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{KubeConfigReference, LocalObjectReference};

    fn instance() -> CueInstance {
        serde_yaml::from_str(
            r"
metadata:
  name: app
  namespace: team-a
spec:
  interval: 5m
  sourceRef:
    kind: GitRepository
    name: repo
  prune: true
",
        )
        .unwrap()
    }

    #[test]
    fn test_identity_precedence() {
        let mut inst = instance();
        assert_eq!(Identity::for_instance(&inst), Identity::Controller);

        inst.spec.service_account_name = Some(String::from("deployer"));
        let identity = Identity::for_instance(&inst);
        assert_eq!(identity.to_string(), "system:serviceaccount:team-a:deployer");

        inst.spec.kube_config = Some(KubeConfigReference {
            secret_ref: LocalObjectReference {
                name: String::from("remote"),
            },
        });
        assert_eq!(
            Identity::for_instance(&inst),
            Identity::KubeConfig {
                namespace: String::from("team-a"),
                secret: String::from("remote"),
            }
        );
    }
}
