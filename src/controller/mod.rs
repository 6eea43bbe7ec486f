//! Controller loop.
//!
//! Runs the [`Reconciler`] under the Kubernetes controller runtime. The runtime
//! coalesces triggers per instance, keeps at most one cycle per instance in
//! flight and schedules the next cycle from the [`Action`] each cycle returns.

use futures::{future, StreamExt, TryStreamExt};
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::store::Writer;
use kube::runtime::{watcher, WatchStreamExt};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::{InstanceKey, RECONCILE_REQUEST_ANNOTATION};
use crate::config::ControllerSettings;
use crate::error::{ControllerError, Result};
use crate::reconciler::{ReconciliationResult, Reconciler};
use crate::state::decode_instance;

/// Shared state handed to every cycle.
struct Context {
    reconciler: Reconciler,
    error_requeue: Duration,
}

/// Runs reconcilers for every watched instance.
pub struct Controller {
    context: Arc<Context>,
    workers: u16,
    resync_interval: Duration,
}

impl Controller {
    /// Creates a controller.
    #[must_use]
    pub fn new(reconciler: Reconciler, settings: &ControllerSettings) -> Self {
        Self {
            context: Arc::new(Context {
                reconciler,
                error_requeue: settings.dependency_requeue,
            }),
            workers: u16::try_from(settings.workers.max(1)).unwrap_or(u16::MAX),
            resync_interval: settings.resync_interval,
        }
    }

    /// Watches `api` and reconciles its instances until SIGINT or SIGTERM.
    ///
    /// Only changes of the generation, the reconcile request annotation or the
    /// deletion timestamp trigger a cycle; status writes do not. Every instance
    /// in the cache is also queued once per resync interval.
    ///
    /// # Errors
    ///
    /// Currently infallible; watch and reconcile errors are logged and retried.
    pub async fn run(self, api: Api<DynamicObject>, resource: ApiResource) -> Result<()> {
        info!(workers = self.workers, resync = ?self.resync_interval, "Starting controller");

        let writer = Writer::new(resource.clone());
        let reader = writer.as_reader();
        let mut filter = TriggerFilter::default();
        let triggers = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects()
            .try_filter(move |object| future::ready(filter.admit(object)));

        let period = self.resync_interval;
        let resync = futures::stream::unfold((), move |()| async move {
            tokio::time::sleep(period).await;
            Some(((), ()))
        });

        controller::Controller::for_stream_with(triggers, reader, resource)
            .with_config(controller::Config::default().concurrency(self.workers))
            .reconcile_all_on(resync)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context)
            .for_each(|outcome| async move {
                match outcome {
                    Ok((object, action)) => debug!(instance = %object, ?action, "Cycle done"),
                    Err(e) => warn!("Controller error: {e}"),
                }
            })
            .await;

        info!("Shutting down controller");
        Ok(())
    }
}

/// Runs one cycle for the instance behind `object`.
async fn reconcile(
    object: Arc<DynamicObject>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, ControllerError> {
    let Some(key) = instance_key(&object) else {
        warn!("Ignoring CueInstance without namespace or name");
        return Ok(Action::await_change());
    };
    let result = ctx.reconciler.reconcile(&key).await?;
    debug!(instance = %key, phase = %result.phase, "Cycle finished");
    Ok(next_action(&result))
}

/// Schedules the retry of a cycle that failed with an error.
fn error_policy(object: Arc<DynamicObject>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let name = object.metadata.name.as_deref().unwrap_or_default();
    error!(instance = name, retryable = error.is_retryable(), "Reconciliation error: {error}");
    Action::requeue(error_requeue(&object, ctx.error_requeue))
}

/// Maps the result of a cycle to the runtime's next action.
fn next_action(result: &ReconciliationResult) -> Action {
    result
        .requeue_after
        .map_or_else(Action::await_change, Action::requeue)
}

/// Delay before retrying after an error: the instance's retry interval when the
/// object decodes, `fallback` otherwise.
fn error_requeue(object: &DynamicObject, fallback: Duration) -> Duration {
    decode_instance(object).map_or(fallback, |instance| instance.retry_interval())
}

fn instance_key(object: &DynamicObject) -> Option<InstanceKey> {
    let namespace = object.metadata.namespace.as_deref()?;
    let name = object.metadata.name.as_deref()?;
    Some(InstanceKey::new(namespace, name))
}

/// Hash of the fields whose change asks for a new cycle.
fn trigger_hash(object: &DynamicObject) -> u64 {
    let metadata = &object.metadata;
    let mut hasher = DefaultHasher::new();
    metadata.generation.hash(&mut hasher);
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(RECONCILE_REQUEST_ANNOTATION))
        .hash(&mut hasher);
    metadata.deletion_timestamp.is_some().hash(&mut hasher);
    hasher.finish()
}

/// Drops watch events that only touch status or unrelated metadata.
#[derive(Default)]
struct TriggerFilter {
    seen: HashMap<InstanceKey, u64>,
}

impl TriggerFilter {
    /// Returns true when `object` is new or its trigger fields changed.
    fn admit(&mut self, object: &DynamicObject) -> bool {
        let Some(key) = instance_key(object) else {
            return true;
        };
        let hash = trigger_hash(object);
        self.seen.insert(key, hash) != Some(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Reason, GROUP, KIND, VERSION};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    fn object(generation: i64, status_reason: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": format!("{GROUP}/{VERSION}"),
            "kind": KIND,
            "metadata": { "name": "app", "namespace": "apps", "generation": generation },
            "spec": {
                "interval": "10m",
                "retryInterval": "2m",
                "sourceRef": { "kind": "GitRepository", "name": "repo" }
            },
            "status": {
                "conditions": [{
                    "type": "Ready",
                    "status": "Unknown",
                    "reason": status_reason,
                    "message": "",
                    "lastTransitionTime": "2026-10-18T10:00:00Z"
                }]
            }
        }))
        .unwrap()
    }

    fn result(requeue_after: Option<Duration>) -> ReconciliationResult {
        ReconciliationResult {
            instance: String::from("apps/app"),
            phase: crate::reconciler::Phase::Succeeded,
            reason: Some(Reason::ReconciliationSucceeded),
            message: String::new(),
            revision: None,
            applied: 0,
            deleted: 0,
            requeue_after,
        }
    }

    #[test]
    fn test_status_change_does_not_trigger() {
        let mut filter = TriggerFilter::default();
        assert!(filter.admit(&object(1, "Progressing")));
        assert!(!filter.admit(&object(1, "ReconciliationSucceeded")));
        assert!(filter.admit(&object(2, "ReconciliationSucceeded")));
    }

    #[test]
    fn test_reconcile_request_triggers() {
        let mut filter = TriggerFilter::default();
        let mut requested = object(1, "Progressing");
        assert!(filter.admit(&requested));

        requested.metadata.annotations = Some(
            [(String::from(RECONCILE_REQUEST_ANNOTATION), String::from("2026-10-18T11:00:00Z"))]
                .into_iter()
                .collect(),
        );
        assert!(filter.admit(&requested));
        assert!(!filter.admit(&requested));
    }

    #[test]
    fn test_deletion_triggers() {
        let mut filter = TriggerFilter::default();
        let mut deleting = object(1, "ReconciliationSucceeded");
        assert!(filter.admit(&deleting));

        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(filter.admit(&deleting));
    }

    #[test]
    fn test_next_action_follows_result() {
        assert_eq!(
            next_action(&result(Some(Duration::from_secs(600)))),
            Action::requeue(Duration::from_secs(600))
        );
        assert_eq!(next_action(&result(None)), Action::await_change());
    }

    #[test]
    fn test_error_requeue_uses_retry_interval() {
        let fallback = Duration::from_secs(30);
        assert_eq!(error_requeue(&object(1, "Progressing"), fallback), Duration::from_secs(120));

        let undecodable: DynamicObject = serde_json::from_value(json!({
            "metadata": { "name": "app", "namespace": "apps" },
            "spec": { "interval": "not a duration" }
        }))
        .unwrap();
        assert_eq!(error_requeue(&undecodable, fallback), fallback);
    }

    #[test]
    fn test_instance_key() {
        assert_eq!(instance_key(&object(1, "Progressing")), Some(InstanceKey::new("apps", "app")));
        let unnamed: DynamicObject = serde_json::from_value(json!({ "metadata": {} })).unwrap();
        assert_eq!(instance_key(&unnamed), None);
    }
}
