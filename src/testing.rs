//! In-memory collaborators for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{
    CueInstance, CueInstanceStatus, InstanceKey, ResourceRef, SourceReference, FINALIZER,
};
use crate::builder::{Evaluation, Evaluator};
use crate::cluster::{ClusterConnector, DeleteOutcome, Identity, TargetCluster};
use crate::error::{BuildError, ClusterError, Result, SourceError, StateError};
use crate::manifest::Manifest;
use crate::source::{Artifact, SourceResolver};

/// Cluster keeping objects in a map and counting mutating calls.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ResourceRef, Manifest>>,
    failing: Mutex<BTreeSet<String>>,
    failing_deletes: Mutex<BTreeSet<String>>,
    slow: Mutex<HashMap<String, Duration>>,
    applies: AtomicUsize,
    deletes: AtomicUsize,
    exists_checks: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes applies of objects named `name` fail.
    pub fn fail_apply(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Makes deletes of objects named `name` fail.
    pub fn fail_delete(&self, name: &str) {
        self.failing_deletes.lock().unwrap().insert(name.to_string());
    }

    /// Makes applies of objects named `name` take `delay`.
    pub fn slow_apply(&self, name: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Removes an object behind the controller's back.
    pub fn remove(&self, name: &str) {
        self.objects.lock().unwrap().retain(|r, _| r.name != name);
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().map(|r| r.name.clone()).collect()
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn exists_checks(&self) -> usize {
        self.exists_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetCluster for FakeCluster {
    async fn apply(&self, manifest: &Manifest) -> std::result::Result<ResourceRef, ClusterError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow.lock().unwrap().get(manifest.name()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(manifest.name()) {
            return Err(ClusterError::api(
                manifest.to_string(),
                "admission webhook denied the request",
            ));
        }
        let resource = manifest.resource_ref();
        self.objects.lock().unwrap().insert(resource.clone(), manifest.clone());
        Ok(resource)
    }

    async fn recreate(
        &self,
        manifest: &Manifest,
    ) -> std::result::Result<ResourceRef, ClusterError> {
        self.objects.lock().unwrap().remove(&manifest.resource_ref());
        self.apply(manifest).await
    }

    async fn delete(
        &self,
        resource: &ResourceRef,
        _honor_opt_out: bool,
    ) -> std::result::Result<DeleteOutcome, ClusterError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.failing_deletes.lock().unwrap().contains(&resource.name) {
            return Err(ClusterError::api(resource.to_string(), "forbidden"));
        }
        match self.objects.lock().unwrap().remove(resource) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn exists(&self, resource: &ResourceRef) -> std::result::Result<bool, ClusterError> {
        self.exists_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().unwrap().contains_key(resource))
    }
}

/// Connector handing out one shared cluster for every identity.
pub struct SharedConnector(pub Arc<FakeCluster>);

#[async_trait]
impl ClusterConnector for SharedConnector {
    async fn connect(
        &self,
        _identity: &Identity,
    ) -> std::result::Result<Arc<dyn TargetCluster>, ClusterError> {
        Ok(self.0.clone())
    }
}

/// Connector whose cluster cannot be reached.
pub struct UnreachableConnector;

#[async_trait]
impl ClusterConnector for UnreachableConnector {
    async fn connect(
        &self,
        identity: &Identity,
    ) -> std::result::Result<Arc<dyn TargetCluster>, ClusterError> {
        Err(ClusterError::Client {
            identity: identity.to_string(),
            message: String::from("kubeconfig secret not found"),
        })
    }
}

/// Resolver returning a fixed directory with a settable revision.
pub struct FakeResolver {
    path: PathBuf,
    revision: Mutex<String>,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn new(path: impl Into<PathBuf>, revision: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            revision: Mutex::new(revision.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_revision(&self, revision: &str) {
        *self.revision.lock().unwrap() = revision.to_string();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceResolver for FakeResolver {
    async fn resolve(
        &self,
        _namespace: &str,
        _source: &SourceReference,
    ) -> std::result::Result<Artifact, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let revision = self.revision.lock().unwrap().clone();
        Ok(Artifact {
            path: self.path.clone(),
            digest: format!("sha256:{revision}"),
            revision,
        })
    }
}

/// Evaluator returning a settable YAML stream.
pub struct FakeEvaluator {
    output: Mutex<std::result::Result<String, String>>,
    calls: AtomicUsize,
}

impl FakeEvaluator {
    pub fn new(output: &str) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(Ok(output.to_string())),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_output(&self, output: &str) {
        *self.output.lock().unwrap() = Ok(output.to_string());
    }

    pub fn set_error(&self, message: &str) {
        *self.output.lock().unwrap() = Err(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, _request: &Evaluation) -> std::result::Result<String, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| BuildError::Evaluation { message })
    }
}

/// Instance store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    instances: Mutex<HashMap<InstanceKey, CueInstance>>,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn with(instances: impl IntoIterator<Item = CueInstance>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.instances.lock().unwrap();
            for instance in instances {
                map.insert(instance.key(), instance);
            }
        }
        Arc::new(store)
    }

    pub fn instance(&self, key: &InstanceKey) -> CueInstance {
        self.instances.lock().unwrap().get(key).cloned().unwrap()
    }

    pub fn update(&self, key: &InstanceKey, change: impl FnOnce(&mut CueInstance)) {
        let mut map = self.instances.lock().unwrap();
        change(map.get_mut(key).unwrap());
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::state::InstanceStore for MemoryStore {
    async fn list(&self) -> Result<Vec<CueInstance>> {
        let mut instances: Vec<CueInstance> =
            self.instances.lock().unwrap().values().cloned().collect();
        instances.sort_by_key(CueInstance::key);
        Ok(instances)
    }

    async fn get(&self, key: &InstanceKey) -> Result<Option<CueInstance>> {
        Ok(self.instances.lock().unwrap().get(key).cloned())
    }

    async fn patch_status(&self, key: &InstanceKey, status: &CueInstanceStatus) -> Result<()> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let mut map = self.instances.lock().unwrap();
        let instance = map
            .get_mut(key)
            .ok_or_else(|| StateError::NotFound { key: key.to_string() })?;
        instance.status = status.clone();
        Ok(())
    }

    async fn set_finalizer(&self, key: &InstanceKey, present: bool) -> Result<()> {
        let mut map = self.instances.lock().unwrap();
        let instance = map
            .get_mut(key)
            .ok_or_else(|| StateError::NotFound { key: key.to_string() })?;
        instance.metadata.finalizers.retain(|f| f != FINALIZER);
        if present {
            instance.metadata.finalizers.push(String::from(FINALIZER));
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Parses an instance from YAML.
pub fn instance(yaml: &str) -> CueInstance {
    serde_yaml::from_str(yaml).unwrap()
}

/// YAML stream of config maps with the given names.
pub fn config_maps(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| {
            format!(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  key: {name}\n"
            )
        })
        .collect::<Vec<_>>()
        .join("---\n")
}
