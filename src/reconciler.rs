//! Reconciler for `CueInstance` resources.
//!
//! This module implements one reconciliation cycle: finalization, dependency
//! gating, source resolution, evaluation, validation, apply, prune and status
//! reporting. Every stage after the gate is bounded by a single deadline.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{
    ConditionStatus, CueInstance, InstanceKey, Reason, ResourceInventory, FINALIZER,
};
use crate::apply::{next_inventory, Applier, Pruner};
use crate::builder::InstanceBuilder;
use crate::cluster::{ClusterConnector, Identity, TargetCluster};
use crate::config::ControllerSettings;
use crate::dependency::{DependencyGate, GateOutcome};
use crate::error::Result;
use crate::manifest::Manifest;
use crate::source::{Artifact, SourceResolver};
use crate::state::InstanceStore;
use crate::status::{CycleOutcome, StatusManager, ValidatedUpdate};
use crate::validate::{CheckerRegistry, Validator};

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The instance no longer exists.
    Gone,
    /// Deletion cleanup ran.
    Finalized,
    /// The instance is suspended.
    Suspended,
    /// A dependency is not ready.
    Waiting,
    /// The revision was already applied and every object still exists.
    Unchanged,
    /// The pipeline ran and succeeded.
    Succeeded,
    /// The pipeline ran and failed.
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            Self::Gone => "gone",
            Self::Finalized => "finalized",
            Self::Suspended => "suspended",
            Self::Waiting => "waiting",
            Self::Unchanged => "unchanged",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(phase)
    }
}

/// Result of a reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    /// Namespaced name of the instance.
    pub instance: String,
    /// How the cycle ended.
    pub phase: Phase,
    /// Reason written to the `Ready` condition, if any.
    pub reason: Option<Reason>,
    /// Human-readable summary.
    pub message: String,
    /// Source revision the cycle worked on.
    pub revision: Option<String>,
    /// Number of objects applied.
    pub applied: usize,
    /// Number of objects deleted.
    pub deleted: usize,
    /// Delay before the next cycle, `None` for no requeue.
    #[serde(skip)]
    pub requeue_after: Option<Duration>,
}

impl ReconciliationResult {
    fn new(key: &InstanceKey, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            instance: key.to_string(),
            phase,
            reason: None,
            message: message.into(),
            revision: None,
            applied: 0,
            deleted: 0,
            requeue_after: None,
        }
    }

    const fn requeue(mut self, after: Duration) -> Self {
        self.requeue_after = Some(after);
        self
    }

    /// Returns true unless the cycle failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.phase != Phase::Failed
    }
}

/// Pipeline state carried between stages.
struct Cycle {
    instance: CueInstance,
    deadline: Instant,
    revision: Option<String>,
    request: Option<String>,
    progress_written: bool,
}

impl Cycle {
    fn fail(&self, reason: Reason, message: impl Into<String>) -> CycleOutcome {
        CycleOutcome::failure(reason, message)
            .with_revision(self.revision.clone())
            .with_reconcile_request(self.request.clone())
    }
}

/// Runs reconciliation cycles.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn InstanceStore>,
    resolver: Arc<dyn SourceResolver>,
    builder: InstanceBuilder,
    connector: Arc<dyn ClusterConnector>,
    gate: DependencyGate,
    validator: Validator,
    status: StatusManager,
    pruner: Pruner,
    dependency_requeue: Duration,
    max_conflict_retries: u32,
}

impl Reconciler {
    /// Creates a reconciler with default settings and the default checker registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        resolver: Arc<dyn SourceResolver>,
        builder: InstanceBuilder,
        connector: Arc<dyn ClusterConnector>,
        gate: DependencyGate,
    ) -> Self {
        let defaults = ControllerSettings::default();
        Self {
            store,
            resolver,
            builder,
            connector,
            gate,
            validator: Validator::new(Arc::new(CheckerRegistry::with_defaults())),
            status: StatusManager::new(),
            pruner: Pruner::new().with_conflict_retries(defaults.max_conflict_retries),
            dependency_requeue: defaults.dependency_requeue,
            max_conflict_retries: defaults.max_conflict_retries,
        }
    }

    /// Replaces the validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Applies controller settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: &ControllerSettings) -> Self {
        self.dependency_requeue = settings.dependency_requeue;
        self.max_conflict_retries = settings.max_conflict_retries;
        self.pruner = self.pruner.with_conflict_retries(settings.max_conflict_retries);
        self
    }

    /// Runs one cycle for the instance `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the instance cannot be read or its status or
    /// finalizer cannot be persisted. Pipeline failures are reported in the
    /// status and the result, not as errors.
    pub async fn reconcile(&self, key: &InstanceKey) -> Result<ReconciliationResult> {
        let Some(mut instance) = self.store.get(key).await? else {
            debug!(instance = %key, "Instance no longer exists");
            return Ok(ReconciliationResult::new(key, Phase::Gone, "instance not found"));
        };

        if instance.is_deleting() {
            return self.finalize(&instance).await;
        }

        if !instance.has_finalizer(FINALIZER) {
            self.store.set_finalizer(key, true).await?;
            instance.metadata.finalizers.push(String::from(FINALIZER));
        }

        if instance.spec.suspend {
            info!(instance = %key, "Reconciliation suspended");
            let result =
                ReconciliationResult::new(key, Phase::Suspended, "reconciliation is suspended");
            return Ok(result.requeue(instance.spec.interval));
        }

        if let GateOutcome::Waiting { message } = self.gate.check(&instance).await {
            info!(instance = %key, "{message}");
            let mut result = ReconciliationResult::new(key, Phase::Waiting, message)
                .requeue(self.dependency_requeue);
            result.reason = Some(Reason::WaitingOnDependency);
            return Ok(result);
        }

        let deadline = Instant::now() + instance.timeout();
        let before = instance.status.clone();
        let mut cycle = Cycle {
            request: instance.pending_reconcile_request().map(ToString::to_string),
            instance,
            deadline,
            revision: None,
            progress_written: false,
        };
        let (outcome, mut result) = self.run_pipeline(&mut cycle).await?;

        let succeeded = outcome.ready == ConditionStatus::True;
        result.reason = Some(outcome.reason);
        result.message.clone_from(&outcome.message);
        result.revision.clone_from(&cycle.revision);

        let generation = cycle.instance.metadata.generation;
        self.status.record(&mut cycle.instance.status, generation, outcome);
        if cycle.progress_written || cycle.instance.status != before {
            self.store.patch_status(key, &cycle.instance.status).await?;
        } else {
            debug!(instance = %key, "Status unchanged");
        }

        let requeue_after = if succeeded {
            info!(
                instance = %key,
                revision = ?cycle.revision,
                "Reconciliation finished: {}", result.phase
            );
            cycle.instance.spec.interval
        } else {
            warn!(
                instance = %key,
                reason = ?result.reason,
                "Reconciliation failed: {}", result.message
            );
            cycle.instance.retry_interval()
        };
        Ok(result.requeue(requeue_after))
    }

    async fn run_pipeline(
        &self,
        cycle: &mut Cycle,
    ) -> Result<(CycleOutcome, ReconciliationResult)> {
        let key = cycle.instance.key();
        let failed = || ReconciliationResult::new(&key, Phase::Failed, "");

        let namespace = cycle.instance.metadata.namespace.clone();
        let source = cycle.instance.spec.source_ref.clone();
        let resolved = bounded(cycle.deadline, self.resolver.resolve(&namespace, &source)).await;
        let artifact: Artifact = match resolved {
            None => {
                return Ok((cycle.fail(Reason::Timeout, "timed out resolving source"), failed()));
            }
            Some(Err(e)) => {
                return Ok((cycle.fail(Reason::SourceUnavailable, e.to_string()), failed()));
            }
            Some(Ok(artifact)) => artifact,
        };
        debug!(instance = %key, revision = %artifact.revision, "Source resolved");
        cycle.revision = Some(artifact.revision.clone());

        if self.is_unchanged(cycle, &artifact.revision).await {
            info!(instance = %key, revision = %artifact.revision, "Revision already applied");
            let outcome = CycleOutcome::success(format!("applied revision: {}", artifact.revision))
                .with_revision(cycle.revision.clone())
                .with_reconcile_request(cycle.request.clone());
            return Ok((outcome, ReconciliationResult::new(&key, Phase::Unchanged, "")));
        }

        self.status
            .progressing(&mut cycle.instance.status, "reconciliation in progress");
        self.store.patch_status(&key, &cycle.instance.status).await?;
        cycle.progress_written = true;

        let build = self.builder.build(&artifact.path, &cycle.instance.spec);
        let manifests = match bounded(cycle.deadline, build).await {
            None => {
                return Ok((cycle.fail(Reason::Timeout, "timed out building instance"), failed()));
            }
            Some(Err(e)) => return Ok((cycle.fail(Reason::BuildFailed, e.to_string()), failed())),
            Some(Ok(manifests)) => manifests,
        };

        let (manifests, validated) = match self.validate(cycle, &artifact, manifests) {
            Ok(validated) => validated,
            Err(outcome) => return Ok((*outcome, failed())),
        };
        if Instant::now() >= cycle.deadline {
            return Ok((cycle.fail(Reason::Timeout, "timed out before apply"), failed()));
        }

        let identity = Identity::for_instance(&cycle.instance);
        let cluster = match self.connector.connect(&identity).await {
            Ok(cluster) => cluster,
            Err(e) => return Ok((cycle.fail(Reason::ApplyFailed, e.to_string()), failed())),
        };

        Ok(self.apply_and_prune(cycle, cluster.as_ref(), manifests, validated).await)
    }

    /// Returns true when the resolved revision is already applied for the current
    /// generation and every inventory entry still exists.
    ///
    /// Connects to the target cluster only when the status already records the
    /// revision as applied.
    async fn is_unchanged(&self, cycle: &Cycle, revision: &str) -> bool {
        let instance = &cycle.instance;
        let status = &instance.status;
        let settled = status.last_attempted_revision == revision
            && status.last_applied_revision == revision
            && status.observed_generation == instance.metadata.generation
            && cycle.request.is_none()
            && status.is_ready();
        let Some(inventory) = status.inventory.as_ref().filter(|_| settled) else {
            return false;
        };

        let cluster = match self.connector.connect(&Identity::for_instance(instance)).await {
            Ok(cluster) => cluster,
            Err(e) => {
                debug!(instance = %instance.key(), error = %e, "Cannot check owned objects");
                return false;
            }
        };

        for entry in &inventory.entries {
            if Instant::now() >= cycle.deadline {
                return false;
            }
            match cluster.exists(entry).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        instance = %instance.key(),
                        resource = %entry,
                        "Owned object missing, re-applying"
                    );
                    return false;
                }
                Err(e) => {
                    debug!(resource = %entry, error = %e, "Existence check failed");
                    return false;
                }
            }
        }
        true
    }

    fn validate(
        &self,
        cycle: &Cycle,
        artifact: &Artifact,
        manifests: Vec<Manifest>,
    ) -> std::result::Result<(Vec<Manifest>, ValidatedUpdate), Box<CycleOutcome>> {
        let Some(validation) = cycle.instance.spec.validate.as_ref() else {
            return Ok((manifests, ValidatedUpdate::Remove));
        };

        let root = cycle.instance.spec.root.as_deref();
        let validated = InstanceBuilder::module_root(&artifact.path, root)
            .map_err(|e| e.to_string())
            .and_then(|root| {
                self.validator
                    .validate(&root, validation, manifests)
                    .map_err(|e| e.to_string())
            });

        match validated {
            Ok(outcome) => {
                let update = match outcome.condition() {
                    None => ValidatedUpdate::Remove,
                    Some((status, reason, message)) => ValidatedUpdate::Set {
                        status,
                        reason,
                        message,
                    },
                };
                Ok((outcome.manifests, update))
            }
            Err(message) => {
                let update = ValidatedUpdate::Set {
                    status: ConditionStatus::False,
                    reason: Reason::ValidationFailed,
                    message: message.clone(),
                };
                Err(Box::new(cycle.fail(Reason::ValidationFailed, message).with_validated(update)))
            }
        }
    }

    async fn apply_and_prune(
        &self,
        cycle: &Cycle,
        cluster: &dyn TargetCluster,
        manifests: Vec<Manifest>,
        validated: ValidatedUpdate,
    ) -> (CycleOutcome, ReconciliationResult) {
        let instance = &cycle.instance;
        let key = instance.key();
        let previous = instance.status.inventory.clone().unwrap_or_default();

        let applier = Applier::new(self.max_conflict_retries).with_force(instance.spec.force);
        let applied = applier
            .apply(cluster, manifests, &instance.metadata.namespace, cycle.deadline)
            .await;
        let pruned = self
            .pruner
            .prune(cluster, &previous, &applied.desired, instance.spec.prune, cycle.deadline)
            .await;
        let inventory: ResourceInventory = next_inventory(&previous, &applied, &pruned);

        let revision = cycle.revision.clone().unwrap_or_default();
        let (reason, message) = if applied.timed_out || pruned.timed_out {
            let mut message = format!("timed out applying revision: {revision}");
            let failures = [applied.failure_message(), pruned.failure_message()];
            for failure in failures.into_iter().flatten() {
                message.push_str("; ");
                message.push_str(&failure);
            }
            (Reason::Timeout, message)
        } else if let Some(message) = applied.failure_message() {
            (Reason::ApplyFailed, message)
        } else if let Some(message) = pruned.failure_message() {
            (Reason::PruneFailed, message)
        } else {
            (Reason::ReconciliationSucceeded, format!("applied revision: {revision}"))
        };

        let mut outcome = if reason == Reason::ReconciliationSucceeded {
            CycleOutcome::success(message)
        } else {
            CycleOutcome::failure(reason, message)
        };
        outcome = outcome
            .with_revision(cycle.revision.clone())
            .with_inventory(inventory)
            .with_applied(applied.is_success())
            .with_validated(validated)
            .with_reconcile_request(cycle.request.clone());

        let phase = if outcome.ready == ConditionStatus::True {
            Phase::Succeeded
        } else {
            Phase::Failed
        };
        let mut result = ReconciliationResult::new(&key, phase, "");
        result.applied = applied.applied.len();
        result.deleted = pruned.deleted.len();
        (outcome, result)
    }

    /// Cleans up after a deleted instance and releases its finalizer.
    async fn finalize(&self, instance: &CueInstance) -> Result<ReconciliationResult> {
        let key = instance.key();
        if !instance.has_finalizer(FINALIZER) {
            return Ok(ReconciliationResult::new(&key, Phase::Finalized, "nothing to finalize"));
        }

        let mut deleted = 0;
        let inventory = instance.status.inventory.clone().unwrap_or_default();
        if instance.spec.prune && !instance.spec.suspend && !inventory.is_empty() {
            let cleanup = match self.connector.connect(&Identity::for_instance(instance)).await {
                Ok(cluster) => {
                    let deadline = Instant::now() + instance.timeout();
                    let report = self
                        .pruner
                        .delete_all(cluster.as_ref(), inventory.entries, deadline)
                        .await;
                    deleted = report.deleted.len();
                    if report.is_success() {
                        Ok(())
                    } else {
                        Err(report
                            .failure_message()
                            .unwrap_or_else(|| String::from("timed out deleting owned objects")))
                    }
                }
                Err(e) => Err(e.to_string()),
            };

            if let Err(message) = cleanup {
                warn!(instance = %key, "Finalization failed: {message}");
                let mut result = ReconciliationResult::new(&key, Phase::Failed, message)
                    .requeue(instance.retry_interval());
                result.reason = Some(Reason::PruneFailed);
                result.deleted = deleted;
                return Ok(result);
            }
        }

        self.store.set_finalizer(&key, false).await?;
        info!(instance = %key, deleted, "Instance finalized");
        let mut result =
            ReconciliationResult::new(&key, Phase::Finalized, "owned objects cleaned up");
        result.deleted = deleted;
        Ok(result)
    }
}

/// Awaits `future` until `deadline`; `None` when the deadline elapses first.
async fn bounded<F: Future>(deadline: Instant, future: F) -> Option<F::Output> {
    tokio::time::timeout_at(deadline, future).await.ok()
}
