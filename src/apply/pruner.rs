//! Garbage collection of objects that left the desired set.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ResourceInventory, ResourceRef};
use crate::cluster::{DeleteOutcome, TargetCluster};
use crate::error::ClusterError;

use super::{summarize, FailedResource};

/// Outcome of a prune pass.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Deleted objects, including ones that were already gone.
    pub deleted: Vec<ResourceRef>,
    /// Objects left in place because they opted out of pruning.
    pub skipped: Vec<ResourceRef>,
    /// Objects that could not be deleted.
    pub failed: Vec<FailedResource>,
    /// Candidates not attempted because the deadline elapsed.
    pub not_attempted: Vec<ResourceRef>,
    /// True when the deadline elapsed before every candidate was handled.
    pub timed_out: bool,
}

impl PruneReport {
    /// Returns true when every candidate was handled without error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.timed_out
    }

    /// Candidates that still exist or may still exist.
    pub fn remaining(&self) -> impl Iterator<Item = &ResourceRef> {
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
        Some(summarize("delete", &self.failed))
    }
}

/// Base delay between conflict retries in milliseconds.
const RETRY_DELAY_MS: u64 = 200;

/// Conflict retries used by [`Pruner::new`].
const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Deletes inventory entries that are no longer desired.
#[derive(Debug, Clone, Copy)]
pub struct Pruner {
    max_conflict_retries: u32,
}

impl Default for Pruner {
    fn default() -> Self {
        Self::new()
    }
}

impl Pruner {
    /// Creates a pruner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// Sets how often a delete rejected by a precondition conflict is retried.
    #[must_use]
    pub const fn with_conflict_retries(mut self, max_conflict_retries: u32) -> Self {
        self.max_conflict_retries = max_conflict_retries;
        self
    }

    /// Deletes every entry of `previous` whose identity is not in `desired`.
    ///
    /// Does nothing when `enabled` is false.
    pub async fn prune(
        &self,
        cluster: &dyn TargetCluster,
        previous: &ResourceInventory,
        desired: &[ResourceRef],
        enabled: bool,
        deadline: Instant,
    ) -> PruneReport {
        if !enabled {
            debug!("Pruning disabled");
            return PruneReport::default();
        }
        let candidates = previous.difference(desired);
        if candidates.is_empty() {
            return PruneReport::default();
        }
        info!("Pruning {} stale resources", candidates.len());
        self.delete_all(cluster, candidates, deadline).await
    }

    /// Deletes every given object, continuing past failures.
    pub async fn delete_all(
        &self,
        cluster: &dyn TargetCluster,
        resources: Vec<ResourceRef>,
        deadline: Instant,
    ) -> PruneReport {
        let mut report = PruneReport::default();

        for resource in resources {
            if Instant::now() >= deadline {
                report.timed_out = true;
                report.not_attempted.push(resource);
                continue;
            }

            match self.delete_one(cluster, &resource, deadline).await {
                Ok(DeleteOutcome::Deleted) => {
                    info!(resource = %resource, "Deleted");
                    report.deleted.push(resource);
                }
                Ok(DeleteOutcome::NotFound) => {
                    debug!(resource = %resource, "Already deleted");
                    report.deleted.push(resource);
                }
                Ok(DeleteOutcome::Skipped) => {
                    info!(resource = %resource, "Pruning disabled by annotation, leaving in place");
                    report.skipped.push(resource);
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Delete failed");
                    report.failed.push(FailedResource {
                        resource,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Deletes one object, retrying when it changed between read and delete.
    async fn delete_one(
        &self,
        cluster: &dyn TargetCluster,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> std::result::Result<DeleteOutcome, ClusterError> {
        let mut attempt = 0;
        loop {
            match cluster.delete(resource, true).await {
                Err(e @ ClusterError::Conflict { .. }) => {
                    attempt += 1;
                    let delay = Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt));
                    if attempt > self.max_conflict_retries || Instant::now() + delay >= deadline {
                        return Err(e);
                    }
                    debug!(
                        resource = %resource,
                        "Conflict retry {attempt} of {}", self.max_conflict_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }
}
