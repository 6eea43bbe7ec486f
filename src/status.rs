//! Status and condition bookkeeping.
//!
//! [`StatusManager`] is the only writer of [`CueInstanceStatus`] fields. The
//! reconciler describes what happened in a [`CycleOutcome`] and the manager
//! turns it into conditions, revisions and the inventory.

use tracing::debug;

use crate::api::{
    Condition, ConditionStatus, CueInstanceStatus, Reason, ResourceInventory, READY_CONDITION,
    VALIDATED_CONDITION,
};

/// What to do with the `Validated` condition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValidatedUpdate {
    /// Leave it as it is.
    #[default]
    Keep,
    /// Remove it.
    Remove,
    /// Set it.
    Set {
        /// Condition status.
        status: ConditionStatus,
        /// Reason.
        reason: Reason,
        /// Message.
        message: String,
    },
}

/// Result of a cycle that ran the pipeline.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// Status of the `Ready` condition.
    pub ready: ConditionStatus,
    /// Reason of the `Ready` condition.
    pub reason: Reason,
    /// Message of the `Ready` condition.
    pub message: String,
    /// Resolved source revision.
    pub revision: Option<String>,
    /// New inventory; `None` keeps the current one.
    pub inventory: Option<ResourceInventory>,
    /// True when the revision was applied without failures.
    pub applied: bool,
    /// Update of the `Validated` condition.
    pub validated: ValidatedUpdate,
    /// Reconcile request handled by the cycle.
    pub reconcile_request: Option<String>,
}

impl CycleOutcome {
    /// A failed cycle that keeps the inventory.
    #[must_use]
    pub fn failure(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            ready: ConditionStatus::False,
            reason,
            message: message.into(),
            revision: None,
            inventory: None,
            applied: false,
            validated: ValidatedUpdate::Keep,
            reconcile_request: None,
        }
    }

    /// A successful cycle.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ready: ConditionStatus::True,
            reason: Reason::ReconciliationSucceeded,
            message: message.into(),
            revision: None,
            inventory: None,
            applied: true,
            validated: ValidatedUpdate::Keep,
            reconcile_request: None,
        }
    }

    /// Sets the resolved revision.
    #[must_use]
    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    /// Sets the inventory to commit.
    #[must_use]
    pub fn with_inventory(mut self, inventory: ResourceInventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Sets the `Validated` update.
    #[must_use]
    pub fn with_validated(mut self, validated: ValidatedUpdate) -> Self {
        self.validated = validated;
        self
    }

    /// Marks whether the revision counts as applied.
    #[must_use]
    pub const fn with_applied(mut self, applied: bool) -> Self {
        self.applied = applied;
        self
    }

    /// Records the handled reconcile request.
    #[must_use]
    pub fn with_reconcile_request(mut self, request: Option<String>) -> Self {
        self.reconcile_request = request;
        self
    }
}

/// Writes instance status.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusManager;

impl StatusManager {
    /// Creates a manager.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Marks a cycle as running: `Ready=Unknown` with reason `Progressing`.
    pub fn progressing(&self, status: &mut CueInstanceStatus, message: &str) {
        self.set_condition(
            status,
            READY_CONDITION,
            ConditionStatus::Unknown,
            Reason::Progressing,
            message,
        );
    }

    /// Records the outcome of a cycle that ran the pipeline.
    pub fn record(&self, status: &mut CueInstanceStatus, generation: i64, outcome: CycleOutcome) {
        status.observed_generation = generation;

        if let Some(revision) = outcome.revision {
            if outcome.applied {
                status.last_applied_revision.clone_from(&revision);
            }
            status.last_attempted_revision = revision;
        }
        if let Some(inventory) = outcome.inventory {
            status.inventory = Some(inventory);
        }
        if outcome.reconcile_request.is_some() {
            status.last_handled_reconcile_at = outcome.reconcile_request;
        }

        match outcome.validated {
            ValidatedUpdate::Keep => {}
            ValidatedUpdate::Remove => self.remove_condition(status, VALIDATED_CONDITION),
            ValidatedUpdate::Set { status: s, reason, message } => {
                self.set_condition(status, VALIDATED_CONDITION, s, reason, &message);
            }
        }

        self.set_condition(
            status,
            READY_CONDITION,
            outcome.ready,
            outcome.reason,
            &outcome.message,
        );
        debug!(
            ready = %outcome.ready,
            reason = %outcome.reason,
            generation,
            "Recorded cycle outcome"
        );
    }

    /// Sets a condition, keeping its transition time when the status is unchanged.
    pub fn set_condition(
        &self,
        status: &mut CueInstanceStatus,
        type_: &str,
        condition_status: ConditionStatus,
        reason: Reason,
        message: &str,
    ) {
        let mut condition = Condition::new(type_, condition_status, reason, message);
        match status.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == condition_status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => status.conditions.push(condition),
        }
    }

    /// Removes a condition.
    pub fn remove_condition(&self, status: &mut CueInstanceStatus, type_: &str) {
        status.conditions.retain(|c| c.type_ != type_);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ResourceRef, MAX_CONDITION_MESSAGE_LENGTH};

    fn inventory(names: &[&str]) -> ResourceInventory {
        ResourceInventory::from_refs(
            names
                .iter()
                .map(|n| ResourceRef::new("v1", "ConfigMap", "default", n)),
        )
    }

    #[test]
    fn test_progressing() {
        let mut status = CueInstanceStatus::default();
        StatusManager::new().progressing(&mut status, "reconciliation in progress");
        let ready = status.condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, "Progressing");
    }

    #[test]
    fn test_success_records_revisions_and_inventory() {
        let mut status = CueInstanceStatus::default();
        StatusManager::new().record(
            &mut status,
            4,
            CycleOutcome::success("applied revision main@sha1:abc")
                .with_revision(Some(String::from("main@sha1:abc")))
                .with_inventory(inventory(&["a"])),
        );

        assert_eq!(status.observed_generation, 4);
        assert_eq!(status.last_applied_revision, "main@sha1:abc");
        assert_eq!(status.last_attempted_revision, "main@sha1:abc");
        assert_eq!(status.inventory, Some(inventory(&["a"])));
        assert!(status.is_ready());
    }

    #[test]
    fn test_failure_keeps_inventory_and_applied_revision() {
        let mut status = CueInstanceStatus {
            last_applied_revision: String::from("v1"),
            inventory: Some(inventory(&["a", "b"])),
            ..CueInstanceStatus::default()
        };
        StatusManager::new().record(
            &mut status,
            2,
            CycleOutcome::failure(Reason::BuildFailed, "field not allowed")
                .with_revision(Some(String::from("v2"))),
        );

        assert_eq!(status.last_applied_revision, "v1");
        assert_eq!(status.last_attempted_revision, "v2");
        assert_eq!(status.inventory, Some(inventory(&["a", "b"])));
        let ready = status.condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "BuildFailed");
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let manager = StatusManager::new();
        let mut status = CueInstanceStatus::default();
        manager.set_condition(
            &mut status,
            READY_CONDITION,
            ConditionStatus::False,
            Reason::ApplyFailed,
            "one",
        );
        let first = status.conditions[0].last_transition_time;

        manager.set_condition(
            &mut status,
            READY_CONDITION,
            ConditionStatus::False,
            Reason::PruneFailed,
            "two",
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, first);
        assert_eq!(status.conditions[0].reason, "PruneFailed");
    }

    #[test]
    fn test_validated_condition_set_and_removed() {
        let manager = StatusManager::new();
        let mut status = CueInstanceStatus::default();
        manager.record(
            &mut status,
            1,
            CycleOutcome::success("ok").with_validated(ValidatedUpdate::Set {
                status: ConditionStatus::False,
                reason: Reason::ValidationAudit,
                message: String::from("1 invalid document"),
            }),
        );
        assert_eq!(status.condition(VALIDATED_CONDITION).unwrap().reason, "ValidationAudit");

        let outcome = CycleOutcome::success("ok").with_validated(ValidatedUpdate::Remove);
        manager.record(&mut status, 1, outcome);
        assert!(status.condition(VALIDATED_CONDITION).is_none());
    }

    #[test]
    fn test_messages_are_truncated() {
        let mut status = CueInstanceStatus::default();
        let message = "x".repeat(MAX_CONDITION_MESSAGE_LENGTH + 100);
        let outcome = CycleOutcome::failure(Reason::BuildFailed, message);
        StatusManager::new().record(&mut status, 1, outcome);

        let ready = status.condition(READY_CONDITION).unwrap();
        assert_eq!(ready.message.len(), MAX_CONDITION_MESSAGE_LENGTH + 3);
        assert!(ready.message.ends_with("..."));
    }

    #[test]
    fn test_reconcile_request_recorded() {
        let mut status = CueInstanceStatus::default();
        StatusManager::new().record(
            &mut status,
            1,
            CycleOutcome::success("ok")
                .with_reconcile_request(Some(String::from("2026-01-01T00:00:00Z"))),
        );
        assert_eq!(status.last_handled_reconcile_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }
}
