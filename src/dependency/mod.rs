//! Dependency gating.
//!
//! An instance only progresses once every `dependsOn` reference exists, reports
//! `Ready=True` and has observed its latest generation.

mod kubernetes;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::api::{self, CueInstance, InstanceKey, READY_CONDITION};
use crate::state::InstanceStore;

pub use kubernetes::KubeReadinessProbe;

/// A dependency with defaults resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTarget {
    /// API version.
    pub api_version: String,
    /// Kind.
    pub kind: String,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl std::fmt::Display for DependencyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Observed readiness of a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready for the latest generation.
    Ready,
    /// The object does not exist.
    NotFound,
    /// The object exists but is not ready; the payload says why.
    NotReady(String),
}

/// Reads the readiness of dependency objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Probes one dependency.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure when the object cannot be read.
    async fn probe(&self, target: &DependencyTarget) -> std::result::Result<Readiness, String>;
}

/// Decision of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Every dependency is ready.
    Ready,
    /// At least one dependency is not ready.
    Waiting {
        /// Which dependency blocks and why.
        message: String,
    },
}

/// Checks the dependencies of instances.
#[derive(Clone)]
pub struct DependencyGate {
    probe: Arc<dyn ReadinessProbe>,
}

impl DependencyGate {
    /// Creates a gate using `probe`.
    #[must_use]
    pub fn new(probe: Arc<dyn ReadinessProbe>) -> Self {
        Self { probe }
    }

    /// Resolves the dependency references of an instance.
    #[must_use]
    pub fn targets(instance: &CueInstance) -> Vec<DependencyTarget> {
        instance
            .spec
            .depends_on
            .iter()
            .map(|dep| DependencyTarget {
                api_version: dep.api_version.clone().unwrap_or_else(api::api_version),
                kind: dep.kind.clone().unwrap_or_else(|| String::from(api::KIND)),
                namespace: dep
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| instance.metadata.namespace.clone()),
                name: dep.name.clone(),
            })
            .collect()
    }

    /// Checks every dependency in order; the first one not ready decides.
    pub async fn check(&self, instance: &CueInstance) -> GateOutcome {
        for target in Self::targets(instance) {
            if target.kind == api::KIND
                && target.namespace == instance.metadata.namespace
                && target.name == instance.metadata.name
            {
                return GateOutcome::Waiting {
                    message: format!("dependency '{target}' refers to the instance itself"),
                };
            }

            let message = match self.probe.probe(&target).await {
                Ok(Readiness::Ready) => {
                    debug!(instance = %instance.key(), dependency = %target, "Dependency ready");
                    continue;
                }
                Ok(Readiness::NotFound) => format!("dependency '{target}' not found"),
                Ok(Readiness::NotReady(reason)) => {
                    format!("dependency '{target}' is not ready: {reason}")
                }
                Err(e) => format!("unable to read dependency '{target}': {e}"),
            };
            return GateOutcome::Waiting { message };
        }
        GateOutcome::Ready
    }
}

/// Derives readiness from an object's `status`, requiring the latest generation
/// to be observed.
#[must_use]
pub fn readiness_of(object: &Value) -> Readiness {
    let generation = object
        .get("metadata")
        .and_then(|m| m.get("generation"))
        .and_then(Value::as_i64);
    let status = object.get("status");
    let observed = status
        .and_then(|s| s.get("observedGeneration"))
        .and_then(Value::as_i64);

    if let (Some(generation), observed) = (generation, observed) {
        if observed != Some(generation) {
            return Readiness::NotReady(format!(
                "generation {generation} not yet observed (observed {})",
                observed.map_or_else(|| String::from("none"), |o| o.to_string())
            ));
        }
    }

    let ready = status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some(READY_CONDITION))
        });

    match ready {
        Some(condition) if condition.get("status").and_then(Value::as_str) == Some("True") => {
            Readiness::Ready
        }
        Some(condition) => Readiness::NotReady(
            condition
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or("Ready condition is not True")
                .to_string(),
        ),
        None => Readiness::NotReady(String::from("no Ready condition")),
    }
}

/// Probe answering from an instance store. Only `CueInstance` dependencies are
/// visible.
#[derive(Clone)]
pub struct StoreReadinessProbe {
    store: Arc<dyn InstanceStore>,
}

impl StoreReadinessProbe {
    /// Creates a probe reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReadinessProbe for StoreReadinessProbe {
    async fn probe(&self, target: &DependencyTarget) -> std::result::Result<Readiness, String> {
        if target.kind != api::KIND {
            return Err(format!("kind {} cannot be read from the local store", target.kind));
        }
        let key = InstanceKey::new(&target.namespace, &target.name);
        let Some(instance) = self.store.get(&key).await.map_err(|e| e.to_string())? else {
            return Ok(Readiness::NotFound);
        };
        let value = serde_json::to_value(&instance).map_err(|e| e.to_string())?;
        Ok(readiness_of(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DependencyReference;
    use serde_json::json;

    fn instance(depends_on: Vec<DependencyReference>) -> CueInstance {
        let mut inst: CueInstance = serde_yaml::from_str(
            r"
metadata:
  name: app
  namespace: apps
spec:
  interval: 5m
  sourceRef:
    kind: GitRepository
    name: repo
  prune: true
",
        )
        .unwrap();
        inst.spec.depends_on = depends_on;
        inst
    }

    fn dep(name: &str, namespace: Option<&str>) -> DependencyReference {
        DependencyReference {
            api_version: None,
            kind: None,
            name: name.to_string(),
            namespace: namespace.map(ToString::to_string),
        }
    }

    #[test]
    fn test_targets_apply_defaults() {
        let targets =
            DependencyGate::targets(&instance(vec![dep("infra", None), dep("db", Some("data"))]));
        assert_eq!(targets[0].namespace, "apps");
        assert_eq!(targets[0].kind, "CueInstance");
        assert_eq!(targets[0].api_version, "cue.contrib.flux.io/v1alpha1");
        assert_eq!(targets[1].namespace, "data");
    }

    #[tokio::test]
    async fn test_all_ready() {
        let mut probe = MockReadinessProbe::new();
        probe.expect_probe().times(2).returning(|_| Ok(Readiness::Ready));
        let gate = DependencyGate::new(Arc::new(probe));
        let outcome = gate.check(&instance(vec![dep("a", None), dep("b", None)])).await;
        assert_eq!(outcome, GateOutcome::Ready);
    }

    #[tokio::test]
    async fn test_first_unready_blocks() {
        let mut probe = MockReadinessProbe::new();
        probe
            .expect_probe()
            .returning(|t| {
                if t.name == "a" {
                    Ok(Readiness::NotReady(String::from("building")))
                } else {
                    Ok(Readiness::Ready)
                }
            });
        let gate = DependencyGate::new(Arc::new(probe));
        let outcome = gate.check(&instance(vec![dep("a", None), dep("b", None)])).await;
        assert_eq!(
            outcome,
            GateOutcome::Waiting {
                message: String::from("dependency 'CueInstance/apps/a' is not ready: building"),
            }
        );
    }

    #[tokio::test]
    async fn test_probe_error_is_waiting() {
        let mut probe = MockReadinessProbe::new();
        probe.expect_probe().returning(|_| Err(String::from("forbidden")));
        let gate = DependencyGate::new(Arc::new(probe));
        let outcome = gate.check(&instance(vec![dep("a", None)])).await;
        assert!(matches!(outcome, GateOutcome::Waiting { .. }));
    }

    #[tokio::test]
    async fn test_self_reference_waits_without_probing() {
        let mut probe = MockReadinessProbe::new();
        probe.expect_probe().never();
        let gate = DependencyGate::new(Arc::new(probe));
        let outcome = gate.check(&instance(vec![dep("app", None)])).await;
        assert!(matches!(
            outcome,
            GateOutcome::Waiting { ref message } if message.contains("itself")
        ));
    }

    #[test]
    fn test_readiness_requires_observed_generation() {
        let stale = json!({
            "metadata": {"generation": 3},
            "status": {"observedGeneration": 2, "conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert!(matches!(readiness_of(&stale), Readiness::NotReady(_)));

        let ready = json!({
            "metadata": {"generation": 3},
            "status": {"observedGeneration": 3, "conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert_eq!(readiness_of(&ready), Readiness::Ready);

        let failing = json!({
            "metadata": {"generation": 1},
            "status": {
                "observedGeneration": 1,
                "conditions": [{"type": "Ready", "status": "False", "message": "apply failed"}]
            }
        });
        assert_eq!(readiness_of(&failing), Readiness::NotReady(String::from("apply failed")));
    }
}
