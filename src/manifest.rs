//! Rendered resource documents.
//!
//! A [`Manifest`] is one object produced by evaluation, guaranteed to carry
//! `apiVersion`, `kind` and `metadata.name`.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::api::ResourceRef;
use crate::error::BuildError;

/// Kinds that are known to be cluster-scoped.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// One rendered object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Manifest {
    object: Map<String, Value>,
}

impl Manifest {
    /// Wraps a JSON value, checking the identifying fields.
    ///
    /// `index` is the position of the document in the evaluation output and is
    /// only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object or misses `apiVersion`,
    /// `kind` or `metadata.name`.
    pub fn from_value(index: usize, value: Value) -> std::result::Result<Self, BuildError> {
        let Value::Object(object) = value else {
            return Err(BuildError::InvalidDocument {
                index,
                message: String::from("document is not an object"),
            });
        };

        for (field, present) in [
            ("apiVersion", non_empty_str(object.get("apiVersion")).is_some()),
            ("kind", non_empty_str(object.get("kind")).is_some()),
            (
                "metadata.name",
                non_empty_str(object.get("metadata").and_then(|m| m.get("name"))).is_some(),
            ),
        ] {
            if !present {
                return Err(BuildError::InvalidDocument {
                    index,
                    message: format!("missing {field}"),
                });
            }
        }

        Ok(Self { object })
    }

    /// Returns the `apiVersion`.
    #[must_use]
    pub fn api_version(&self) -> &str {
        non_empty_str(self.object.get("apiVersion")).unwrap_or_default()
    }

    /// Returns the `kind`.
    #[must_use]
    pub fn kind(&self) -> &str {
        non_empty_str(self.object.get("kind")).unwrap_or_default()
    }

    /// Returns `metadata.name`.
    #[must_use]
    pub fn name(&self) -> &str {
        non_empty_str(self.metadata().and_then(|m| m.get("name"))).unwrap_or_default()
    }

    /// Returns `metadata.namespace` when set.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        non_empty_str(self.metadata().and_then(|m| m.get("namespace")))
    }

    /// Returns a `metadata.annotations` entry.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    /// Returns true when the kind is known to be cluster-scoped.
    #[must_use]
    pub fn is_known_cluster_scoped(&self) -> bool {
        CLUSTER_SCOPED_KINDS.contains(&self.kind())
    }

    /// Places a namespaced object without namespace into `namespace`.
    ///
    /// Known cluster-scoped kinds are left untouched.
    pub fn default_namespace(&mut self, namespace: &str) {
        if self.namespace().is_some() || self.is_known_cluster_scoped() || namespace.is_empty() {
            return;
        }
        if let Some(Value::Object(metadata)) = self.object.get_mut("metadata") {
            metadata.insert(String::from("namespace"), Value::String(namespace.to_string()));
        }
    }

    /// Returns the reference derived from the document itself.
    #[must_use]
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(
            self.api_version(),
            self.kind(),
            self.namespace().unwrap_or_default(),
            self.name(),
        )
    }

    /// Ordering rank: definitions first, then namespaces, then other cluster-scoped
    /// kinds, then everything else.
    #[must_use]
    pub fn apply_rank(&self) -> u8 {
        match self.kind() {
            "CustomResourceDefinition" => 0,
            "Namespace" => 1,
            _ if self.is_known_cluster_scoped() => 2,
            _ => 3,
        }
    }

    /// Returns the underlying object.
    #[must_use]
    pub fn as_object(&self) -> &Map<String, Value> {
        &self.object
    }

    /// Returns the object as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.object.clone())
    }

    fn metadata(&self) -> Option<&Value> {
        self.object.get("metadata")
    }
}

impl std::fmt::Display for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{}/{}/{}", self.kind(), ns, self.name()),
            None => write!(f, "{}/{}", self.kind(), self.name()),
        }
    }
}

/// Sorts manifests into apply order, keeping the original order within a rank.
pub fn sort_for_apply(manifests: &mut [Manifest]) {
    manifests.sort_by_key(Manifest::apply_rank);
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
pub(crate) fn config_map(name: &str) -> Manifest {
    Manifest::from_value(
        0,
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name},
            "data": {"key": name}
        }),
    )
    .expect("valid config map")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(value: Value) -> Manifest {
        Manifest::from_value(0, value).unwrap()
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let kindless = json!({"apiVersion": "v1", "metadata": {"name": "x"}});
        let err = Manifest::from_value(2, kindless).unwrap_err();
        assert_eq!(
            err,
            BuildError::InvalidDocument {
                index: 2,
                message: String::from("missing kind"),
            }
        );
        assert!(Manifest::from_value(0, json!({"apiVersion": "v1", "kind": "ConfigMap"})).is_err());
        assert!(Manifest::from_value(0, json!("text")).is_err());
    }

    #[test]
    fn test_default_namespace() {
        let mut cm = config_map("settings");
        cm.default_namespace("apps");
        assert_eq!(cm.namespace(), Some("apps"));
        assert_eq!(cm.resource_ref(), ResourceRef::new("v1", "ConfigMap", "apps", "settings"));

        let mut ns = manifest(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "apps"}
        }));
        ns.default_namespace("apps");
        assert_eq!(ns.namespace(), None);

        let mut explicit = manifest(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "token", "namespace": "infra"}
        }));
        explicit.default_namespace("apps");
        assert_eq!(explicit.namespace(), Some("infra"));
    }

    #[test]
    fn test_sort_for_apply_is_stable() {
        let mut manifests = vec![
            config_map("first"),
            manifest(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "apps"}
            })),
            config_map("second"),
            manifest(json!({
                "apiVersion": "apiextensions.k8s.io/v1",
                "kind": "CustomResourceDefinition",
                "metadata": {"name": "widgets.example.com"}
            })),
            manifest(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRole",
                "metadata": {"name": "reader"}
            })),
        ];
        sort_for_apply(&mut manifests);
        let names: Vec<&str> = manifests.iter().map(Manifest::name).collect();
        assert_eq!(names, vec!["widgets.example.com", "apps", "reader", "first", "second"]);
    }

    #[test]
    fn test_annotation_lookup() {
        let m = manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "x", "annotations": {"cue.contrib.flux.io/prune": "disabled"}}
        }));
        assert_eq!(m.annotation("cue.contrib.flux.io/prune"), Some("disabled"));
        assert_eq!(m.annotation("missing"), None);
    }
}
