//! `CueInstance` data model.
//!
//! This module defines the persisted resource the controller reconciles:
//! - The user-authored spec and its resolved defaults
//! - The controller-authored status, conditions and inventory
//! - Go-style duration (de)serialization used by the spec

pub mod duration;
mod condition;
mod instance;
mod inventory;

pub use condition::{
    Condition, ConditionStatus, Reason, MAX_CONDITION_MESSAGE_LENGTH, READY_CONDITION,
    VALIDATED_CONDITION, truncate_message,
};
pub use instance::{
    CueInstance, CueInstanceSpec, CueInstanceStatus, DependencyReference, InstanceKey,
    InstanceMeta, KubeConfigReference, LocalObjectReference, SourceReference, TagVar, Validation,
    ValidationMode,
};
pub use inventory::{ResourceInventory, ResourceRef};

/// API group of the `CueInstance` resource.
pub const GROUP: &str = "cue.contrib.flux.io";

/// API version of the `CueInstance` resource.
pub const VERSION: &str = "v1alpha1";

/// Kind of the reconciled resource.
pub const KIND: &str = "CueInstance";

/// Finalizer guarding inventory cleanup on deletion.
pub const FINALIZER: &str = "finalizers.fluxcd.io";

/// Annotation requesting an immediate reconciliation.
pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// Annotation that opts a single object out of pruning.
pub const PRUNE_ANNOTATION: &str = "cue.contrib.flux.io/prune";

/// Value of [`PRUNE_ANNOTATION`] that disables pruning.
pub const DISABLED_VALUE: &str = "disabled";

/// Returns `group/version` for the `CueInstance` resource.
#[must_use]
pub fn api_version() -> String {
    format!("{GROUP}/{VERSION}")
}
