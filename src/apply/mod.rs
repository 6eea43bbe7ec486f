//! Applying desired manifests and pruning stale objects.
//!
//! This module provides:
//! - [`Applier`]: ordered server-side apply with per-resource failure aggregation
//! - [`Pruner`]: deletion of objects that left the desired set
//! - [`next_inventory`]: the inventory committed at the end of a cycle

mod applier;
mod pruner;

use std::fmt::Write as _;

use crate::api::{ResourceInventory, ResourceRef};

pub use applier::{ApplyReport, Applier};
pub use pruner::{PruneReport, Pruner};

/// A resource whose operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedResource {
    /// The resource.
    pub resource: ResourceRef,
    /// Why the operation failed.
    pub error: String,
}

/// Joins failures into one message.
#[must_use]
pub fn summarize(verb: &str, failures: &[FailedResource]) -> String {
    let mut message = format!("failed to {verb} {} object(s):", failures.len());
    for failure in failures {
        let _ = write!(message, "\n{}: {}", failure.resource, failure.error);
    }
    message
}

/// Computes the inventory to persist after the apply and prune stages.
///
/// The result holds every applied object, every object that failed to apply
/// but was already owned, and every prune candidate that was not deleted.
#[must_use]
pub fn next_inventory(
    previous: &ResourceInventory,
    applied: &ApplyReport,
    pruned: &PruneReport,
) -> ResourceInventory {
    let retained_failures = previous
        .entries
        .iter()
        .filter(|entry| applied.unsettled().any(|resource| same_object(entry, resource)))
        .cloned();

    ResourceInventory::from_refs(
        retained_failures
            .chain(pruned.remaining().cloned())
            .chain(applied.applied.iter().cloned()),
    )
}

/// Matches an inventory entry against a rendered reference whose namespace may
/// have been defaulted onto a cluster-scoped object.
fn same_object(entry: &ResourceRef, resource: &ResourceRef) -> bool {
    entry == resource
        || (entry.namespace.is_empty()
            && entry.group == resource.group
            && entry.kind == resource.kind
            && entry.name == resource.name)
}
