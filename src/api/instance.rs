//! The `CueInstance` resource.
//!
//! The spec is authored by users and only read by the controller. The status is
//! written exclusively through [`crate::status::StatusManager`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::condition::{Condition, READY_CONDITION};
use super::duration;
use super::inventory::ResourceInventory;

/// Lower bound of the resolved per-cycle timeout.
const MIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Margin subtracted from the interval when no timeout is configured.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// The reconciled resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CueInstance {
    /// Object metadata.
    pub metadata: InstanceMeta,
    /// Desired state.
    pub spec: CueInstanceSpec,
    /// Observed state.
    #[serde(default)]
    pub status: CueInstanceStatus,
}

/// The subset of object metadata the controller reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMeta {
    /// Object name.
    pub name: String,
    /// Object namespace.
    #[serde(default)]
    pub namespace: String,
    /// Spec generation, bumped on every spec edit.
    #[serde(default)]
    pub generation: i64,
    /// Object annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers present on the object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Set when the object is being deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Desired state of a `CueInstance`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CueInstanceSpec {
    /// Reconciliation cadence after a successful cycle.
    #[serde(with = "duration")]
    pub interval: Duration,
    /// Source producing the artifact.
    pub source_ref: SourceReference,
    /// Module root inside the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Instance path relative to the module root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Package to evaluate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Tags injected into the instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagVar>,
    /// Tag variables available to the instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_vars: Vec<TagVar>,
    /// Expressions evaluated instead of the whole instance.
    #[serde(default, rename = "expressions", skip_serializing_if = "Vec::is_empty")]
    pub exprs: Vec<String>,
    /// Resources that must be ready first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyReference>,
    /// Enables garbage collection of resources no longer desired.
    pub prune: bool,
    /// Cadence after a failed cycle.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<Duration>,
    /// Deadline of one cycle.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Stops reconciliation while true.
    #[serde(default)]
    pub suspend: bool,
    /// Service account impersonated when applying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Kubeconfig of a remote target cluster. Takes precedence over the service account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<KubeConfigReference>,
    /// Recreate resources whose immutable fields changed.
    #[serde(default)]
    pub force: bool,
    /// Schema validation policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<Validation>,
}

/// Reference to a Flux source object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// API version of the source, defaults to `source.toolkit.fluxcd.io/v1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the source, e.g. `GitRepository`.
    pub kind: String,
    /// Name of the source.
    pub name: String,
    /// Namespace of the source, defaults to the instance namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to another reconcilable resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    /// API version, defaults to this resource's group/version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind, defaults to `CueInstance`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name of the dependency.
    pub name: String,
    /// Namespace, defaults to the instance namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A build parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagVar {
    /// Tag name.
    pub name: String,
    /// Optional tag value. A tag without value is a boolean tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Reference to a secret holding a kubeconfig under `value` (or `value.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigReference {
    /// The secret in the instance namespace.
    pub secret_ref: LocalObjectReference,
}

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Object name.
    pub name: String,
}

/// Schema validation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// Policy applied to invalid documents.
    #[serde(default)]
    pub mode: ValidationMode,
    /// Schema file path inside the artifact, or an inline schema document.
    pub schema: String,
    /// Document type selecting the schema checker.
    #[serde(default = "default_validation_type", rename = "type")]
    pub type_: String,
}

/// What to do with documents that fail validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Validate but discard the outcome.
    Ignore,
    /// Report invalid documents, apply everything.
    #[default]
    Audit,
    /// Remove invalid documents, apply the rest.
    Drop,
    /// Abort the cycle when any document is invalid.
    Fail,
}

/// Observed state of a `CueInstance`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CueInstanceStatus {
    /// Last spec generation a cycle ran for.
    #[serde(default)]
    pub observed_generation: i64,
    /// Status conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Revision of the last successful apply.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_applied_revision: String,
    /// Revision of the last attempt.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_attempted_revision: String,
    /// Resources owned by the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<ResourceInventory>,
    /// Last processed value of the reconcile request annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

/// Namespaced name identifying an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

fn default_validation_type() -> String {
    String::from("yaml")
}

impl InstanceKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl CueInstance {
    /// Returns the namespaced name of the instance.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Resolved per-cycle deadline.
    ///
    /// `spec.timeout` when set, otherwise `interval - 30s`; never below 30s.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        let duration = self
            .spec
            .timeout
            .unwrap_or_else(|| self.spec.interval.saturating_sub(TIMEOUT_MARGIN));
        duration.max(MIN_TIMEOUT)
    }

    /// Resolved delay before retrying a failed cycle.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.spec.retry_interval.unwrap_or(self.spec.interval)
    }

    /// Returns true when the object is being deleted.
    #[must_use]
    pub const fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true when the finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns the pending reconcile request, if it has not been handled yet.
    #[must_use]
    pub fn pending_reconcile_request(&self) -> Option<&str> {
        let requested = self
            .metadata
            .annotations
            .get(super::RECONCILE_REQUEST_ANNOTATION)?;
        if self.status.last_handled_reconcile_at.as_deref() == Some(requested.as_str()) {
            None
        } else {
            Some(requested.as_str())
        }
    }

    /// Returns the `Ready` condition, if any.
    #[must_use]
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status.condition(READY_CONDITION)
    }
}

impl CueInstanceStatus {
    /// Returns the condition of the given type.
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Returns true when the `Ready` condition is `True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.condition(READY_CONDITION).is_some_and(Condition::is_true)
    }
}

impl SourceReference {
    /// Default API version of Flux sources.
    pub const DEFAULT_API_VERSION: &'static str = "source.toolkit.fluxcd.io/v1";

    /// Returns the API version, applying the default.
    #[must_use]
    pub fn api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or(Self::DEFAULT_API_VERSION)
    }

    /// Returns the namespace, defaulting to `default_namespace`.
    #[must_use]
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
    }
}

impl std::fmt::Display for SourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            _ => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl TagVar {
    /// Creates a tag with a value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self {
            Self::Ignore => "Ignore",
            Self::Audit => "Audit",
            Self::Drop => "Drop",
            Self::Fail => "Fail",
        };
        f.write_str(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_with(interval: u64, timeout: Option<u64>, retry: Option<u64>) -> CueInstance {
        CueInstance {
            metadata: InstanceMeta {
                name: String::from("app"),
                namespace: String::from("default"),
                generation: 1,
                ..InstanceMeta::default()
            },
            spec: CueInstanceSpec {
                interval: Duration::from_secs(interval),
                source_ref: SourceReference {
                    api_version: None,
                    kind: String::from("GitRepository"),
                    name: String::from("repo"),
                    namespace: None,
                },
                root: None,
                path: None,
                package: None,
                tags: vec![],
                tag_vars: vec![],
                exprs: vec![],
                depends_on: vec![],
                prune: true,
                retry_interval: retry.map(Duration::from_secs),
                timeout: timeout.map(Duration::from_secs),
                suspend: false,
                service_account_name: None,
                kube_config: None,
                force: false,
                validate: None,
            },
            status: CueInstanceStatus::default(),
        }
    }

    #[test]
    fn test_timeout_defaults_to_interval_minus_margin() {
        assert_eq!(instance_with(600, None, None).timeout(), Duration::from_secs(570));
    }

    #[test]
    fn test_timeout_is_floored() {
        assert_eq!(instance_with(40, None, None).timeout(), Duration::from_secs(30));
        assert_eq!(instance_with(10, None, None).timeout(), Duration::from_secs(30));
        assert_eq!(instance_with(600, Some(5), None).timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_timeout_uses_explicit_value() {
        assert_eq!(instance_with(600, Some(120), None).timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_timeout_never_below_floor() {
        for interval in [0, 1, 29, 30, 31, 59, 60, 61, 3_600] {
            for timeout in [None, Some(0), Some(29), Some(31), Some(900)] {
                assert!(instance_with(interval, timeout, None).timeout() >= MIN_TIMEOUT);
            }
        }
    }

    #[test]
    fn test_retry_interval_resolution() {
        assert_eq!(instance_with(600, None, None).retry_interval(), Duration::from_secs(600));
        assert_eq!(instance_with(600, None, Some(60)).retry_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_deserialize_instance_yaml() {
        let yaml = r"
metadata:
  name: podinfo
  namespace: apps
  generation: 3
spec:
  interval: 10m
  retryInterval: 1m30s
  sourceRef:
    kind: GitRepository
    name: podinfo
  root: ./cue
  path: ./deploy
  package: main
  tags:
    - name: env
      value: prod
    - name: debug
  expressions:
    - out
  dependsOn:
    - name: infra
      namespace: infra
  prune: true
  force: true
  validate:
    mode: Drop
    schema: schema.json
";
        let instance: CueInstance = serde_yaml::from_str(yaml).expect("valid instance");
        assert_eq!(instance.key(), InstanceKey::new("apps", "podinfo"));
        assert_eq!(instance.spec.interval, Duration::from_secs(600));
        assert_eq!(instance.retry_interval(), Duration::from_secs(90));
        assert_eq!(instance.spec.tags[1].value, None);
        assert_eq!(instance.spec.exprs, vec![String::from("out")]);
        let validate = instance.spec.validate.expect("validate block");
        assert_eq!(validate.mode, ValidationMode::Drop);
        assert_eq!(validate.type_, "yaml");
        assert_eq!(instance.status, CueInstanceStatus::default());
    }

    #[test]
    fn test_pending_reconcile_request() {
        let mut instance = instance_with(600, None, None);
        assert_eq!(instance.pending_reconcile_request(), None);

        instance.metadata.annotations.insert(
            String::from(crate::api::RECONCILE_REQUEST_ANNOTATION),
            String::from("2024-01-01T00:00:00Z"),
        );
        assert_eq!(instance.pending_reconcile_request(), Some("2024-01-01T00:00:00Z"));

        instance.status.last_handled_reconcile_at = Some(String::from("2024-01-01T00:00:00Z"));
        assert_eq!(instance.pending_reconcile_request(), None);
    }
}
