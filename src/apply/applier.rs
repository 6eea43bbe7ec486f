//! Ordered server-side apply.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::ResourceRef;
use crate::cluster::TargetCluster;
use crate::error::ClusterError;
use crate::manifest::{sort_for_apply, Manifest};

use super::{summarize, FailedResource};

/// Base delay between conflict retries in milliseconds.
const RETRY_DELAY_MS: u64 = 200;

/// Outcome of applying a set of manifests.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// References of the applied objects as returned by the cluster.
    pub applied: Vec<ResourceRef>,
    /// Objects that could not be applied.
    pub failed: Vec<FailedResource>,
    /// Objects skipped because the deadline elapsed.
    pub not_attempted: Vec<ResourceRef>,
    /// Every identity the applier was asked to apply.
    pub desired: Vec<ResourceRef>,
    /// True when the deadline elapsed before every manifest was handled.
    pub timed_out: bool,
}

impl ApplyReport {
    /// Returns true when every manifest was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.timed_out
    }

    /// References that were desired but are not known to be applied.
    pub fn unsettled(&self) -> impl Iterator<Item = &ResourceRef> {
        self.failed
            .iter()
            .map(|f| &f.resource)
            .chain(self.not_attempted.iter())
    }

    /// Describes the failures, if any.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        Some(summarize("apply", &self.failed))
    }
}

/// Applies manifests one by one in dependency-friendly order.
#[derive(Debug, Clone)]
pub struct Applier {
    max_conflict_retries: u32,
    force: bool,
}

impl Applier {
    /// Creates an applier retrying version conflicts up to `max_conflict_retries` times.
    #[must_use]
    pub const fn new(max_conflict_retries: u32) -> Self {
        Self {
            max_conflict_retries,
            force: false,
        }
    }

    /// Recreates objects whose immutable fields changed.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Applies every manifest, continuing past per-resource failures.
    ///
    /// Namespaced objects without a namespace are placed in `namespace`. No new
    /// operation starts once `deadline` has passed.
    pub async fn apply(
        &self,
        cluster: &dyn TargetCluster,
        mut manifests: Vec<Manifest>,
        namespace: &str,
        deadline: Instant,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        for manifest in &mut manifests {
            let defaulted = manifest.namespace().is_none();
            manifest.default_namespace(namespace);
            if defaulted && manifest.namespace().is_some() {
                // The object may still turn out to be cluster-scoped.
                let mut bare = manifest.resource_ref();
                bare.namespace.clear();
                report.desired.push(bare);
            }
            report.desired.push(manifest.resource_ref());
        }
        sort_for_apply(&mut manifests);

        info!("Applying {} resources", manifests.len());

        for manifest in &manifests {
            if Instant::now() >= deadline {
                report.timed_out = true;
                report.not_attempted.push(manifest.resource_ref());
                continue;
            }

            match self.apply_one(cluster, manifest).await {
                Ok(applied) => {
                    debug!(resource = %applied, "Applied");
                    report.desired.push(applied.clone());
                    report.applied.push(applied);
                }
                Err(e) => {
                    warn!(resource = %manifest, error = %e, "Apply failed");
                    report.failed.push(FailedResource {
                        resource: manifest.resource_ref(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.timed_out {
            warn!("Deadline reached with {} resources not applied", report.not_attempted.len());
        }
        report
    }

    async fn apply_one(
        &self,
        cluster: &dyn TargetCluster,
        manifest: &Manifest,
    ) -> std::result::Result<ResourceRef, ClusterError> {
        let mut last_error = None;

        for attempt in 0..=self.max_conflict_retries {
            if attempt > 0 {
                debug!(
                    resource = %manifest,
                    "Conflict retry {attempt} of {}", self.max_conflict_retries
                );
                let delay = Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt));
                tokio::time::sleep(delay).await;
            }

            match cluster.apply(manifest).await {
                Ok(applied) => return Ok(applied),
                Err(e @ ClusterError::Conflict { .. }) => last_error = Some(e),
                Err(e @ ClusterError::ImmutableField { .. }) => {
                    if !self.force {
                        return Err(e);
                    }
                    info!(resource = %manifest, "Recreating object with immutable field changes");
                    return cluster.recreate(manifest).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClusterError::api(manifest.to_string(), "apply not attempted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockTargetCluster;
    use crate::manifest::config_map;
    use serde_json::json;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn namespaced(m: &Manifest) -> ResourceRef {
        m.resource_ref()
    }

    #[tokio::test]
    async fn test_apply_defaults_namespace_and_orders() {
        let ns = Manifest::from_value(
            0,
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "apps"}}),
        )
        .unwrap();
        let mut cluster = MockTargetCluster::new();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = order.clone();
        cluster.expect_apply().times(2).returning(move |m| {
            seen.lock().unwrap().push(m.kind().to_string());
            Ok(namespaced(m))
        });

        let report = Applier::new(3)
            .apply(&cluster, vec![config_map("a"), ns], "apps", deadline())
            .await;

        assert!(report.is_success());
        assert_eq!(*order.lock().unwrap(), vec!["Namespace", "ConfigMap"]);
        assert_eq!(report.applied[1], ResourceRef::new("v1", "ConfigMap", "apps", "a"));
        assert_eq!(report.applied[0].namespace, "");
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_others() {
        let mut cluster = MockTargetCluster::new();
        cluster.expect_apply().times(3).returning(|m| {
            if m.name() == "b" {
                Err(ClusterError::api(m.to_string(), "admission webhook denied"))
            } else {
                Ok(namespaced(m))
            }
        });

        let manifests = vec![config_map("a"), config_map("b"), config_map("c")];
        let report = Applier::new(3)
            .apply(&cluster, manifests, "default", deadline())
            .await;

        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource.name, "b");
        assert!(report.failure_message().unwrap().contains("admission webhook denied"));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let mut cluster = MockTargetCluster::new();
        let mut calls = 0;
        cluster.expect_apply().times(3).returning(move |m| {
            calls += 1;
            if calls < 3 {
                Err(ClusterError::Conflict {
                    resource: m.to_string(),
                    message: String::from("the object has been modified"),
                })
            } else {
                Ok(namespaced(m))
            }
        });

        let report = Applier::new(3)
            .apply(&cluster, vec![config_map("a")], "default", deadline())
            .await;
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let mut cluster = MockTargetCluster::new();
        cluster.expect_apply().times(2).returning(|m| {
            Err(ClusterError::Conflict {
                resource: m.to_string(),
                message: String::from("modified"),
            })
        });

        let report = Applier::new(1)
            .apply(&cluster, vec![config_map("a")], "default", deadline())
            .await;
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_immutable_change_without_force_fails() {
        let mut cluster = MockTargetCluster::new();
        cluster.expect_apply().times(1).returning(|m| {
            Err(ClusterError::ImmutableField {
                resource: m.to_string(),
                message: String::from("field is immutable"),
            })
        });
        cluster.expect_recreate().never();

        let report = Applier::new(3)
            .apply(&cluster, vec![config_map("a")], "default", deadline())
            .await;
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_immutable_change_with_force_recreates() {
        let mut cluster = MockTargetCluster::new();
        cluster.expect_apply().times(1).returning(|m| {
            Err(ClusterError::ImmutableField {
                resource: m.to_string(),
                message: String::from("field is immutable"),
            })
        });
        cluster.expect_recreate().times(1).returning(|m| Ok(namespaced(m)));

        let report = Applier::new(3)
            .with_force(true)
            .apply(&cluster, vec![config_map("a")], "default", deadline())
            .await;
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_elapsed_deadline_starts_nothing() {
        let mut cluster = MockTargetCluster::new();
        cluster.expect_apply().never();

        let report = Applier::new(3)
            .apply(&cluster, vec![config_map("a"), config_map("b")], "default", Instant::now())
            .await;

        assert!(report.timed_out);
        assert!(!report.is_success());
        assert_eq!(report.not_attempted.len(), 2);
        assert_eq!(report.unsettled().count(), 2);
    }
}
