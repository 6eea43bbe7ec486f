//! Local file-based instance store.
//!
//! Instance specs are read from YAML files; status and finalizers are persisted
//! as JSON records in a state directory, one record per instance. This backend
//! runs single cycles outside a cluster watch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::api::{CueInstance, CueInstanceStatus, InstanceKey};
use crate::error::{ConfigError, ControllerError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::InstanceStore;

/// Default state directory name.
const STATE_DIR: &str = ".cue-controller";

/// Namespace given to instance files that do not set one.
const DEFAULT_NAMESPACE: &str = "default";

/// Persisted record of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredInstance {
    /// Last known instance, including status and finalizers.
    instance: CueInstance,
    /// When the record was written.
    updated_at: DateTime<Utc>,
}

/// Local file-based instance store.
#[derive(Debug)]
pub struct LocalInstanceStore {
    /// Directory holding status records and lock files.
    base_dir: PathBuf,
    /// Instance spec files served by this store.
    instance_files: Vec<PathBuf>,
}

impl LocalInstanceStore {
    /// Creates a store rooted at `.cue-controller` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| {
                ControllerError::internal(format!("Cannot determine current directory: {e}"))
            })?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom state directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            instance_files: Vec::new(),
        }
    }

    /// Serves the instance described by a YAML file.
    #[must_use]
    pub fn with_instance_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.instance_files.push(path.into());
        self
    }

    /// Returns the state directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_stem(key: &InstanceKey) -> String {
        format!("{}_{}", key.namespace, key.name)
    }

    fn record_path(&self, key: &InstanceKey) -> PathBuf {
        self.base_dir.join(format!("{}.json", Self::file_stem(key)))
    }

    fn lock_path(&self, key: &InstanceKey) -> PathBuf {
        self.base_dir.join(format!("{}.lock", Self::file_stem(key)))
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ControllerError::State(StateError::Api {
                    message: format!("Failed to create state directory: {e}"),
                })
            })?;
        }
        Ok(())
    }

    async fn read_instance_file(path: &Path) -> Result<CueInstance> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ControllerError::Config(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                })
            } else {
                ControllerError::Config(ConfigError::ParseError {
                    message: format!("Failed to read file: {e}"),
                    location: Some(path.display().to_string()),
                })
            }
        })?;

        let mut instance: CueInstance = serde_yaml::from_str(&content).map_err(|e| {
            ControllerError::Config(ConfigError::ParseError {
                message: format!("Invalid CueInstance: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        if instance.metadata.namespace.is_empty() {
            instance.metadata.namespace = String::from(DEFAULT_NAMESPACE);
        }
        Ok(instance)
    }

    async fn read_record(&self, key: &InstanceKey) -> Result<Option<StoredInstance>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record_file(&path).await.map(Some)
    }

    async fn read_record_file(path: &Path) -> Result<StoredInstance> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read state file {}: {e}", path.display()))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            let message = format!("Failed to parse state file {}: {e}", path.display());
            StateError::corrupted(message).into()
        })
    }

    /// Writes a record to a temporary file first, then renames it into place.
    async fn write_record(&self, instance: &CueInstance) -> Result<()> {
        self.ensure_dir().await?;

        let record = StoredInstance {
            instance: instance.clone(),
            updated_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let path = self.record_path(&instance.key());
        let temp_path = path.with_extension("tmp");
        write_synced(&temp_path, content.as_bytes()).await?;

        fs::rename(&temp_path, &path).await.map_err(|e| {
            ControllerError::State(StateError::Api {
                message: format!("Failed to rename state file: {e}"),
            })
        })?;

        debug!("State saved to {}", path.display());
        Ok(())
    }

    /// Loads an instance file merged with its stored status and finalizers.
    async fn load_merged(&self, path: &Path) -> Result<CueInstance> {
        let mut instance = Self::read_instance_file(path).await?;
        if let Some(record) = self.read_record(&instance.key()).await? {
            instance.status = record.instance.status;
            instance.metadata.finalizers = record.instance.metadata.finalizers;
        }
        Ok(instance)
    }

    /// Lists every stored record.
    async fn list_records(&self) -> Result<Vec<CueInstance>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut instances = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                instances.push(Self::read_record_file(&path).await?.instance);
            }
        }
        instances.sort_by_key(CueInstance::key);
        Ok(instances)
    }

    async fn read_lock_file(&self, key: &InstanceKey) -> Result<Option<LockInfo>> {
        let path = self.lock_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Acquires the lock of one instance.
    ///
    /// An expired lock is taken over. An empty `holder` is replaced by a
    /// host-pid-uuid identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if another process holds a live lock or the lock file
    /// cannot be written.
    pub async fn acquire_lock(&self, key: &InstanceKey, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file(key).await? {
            if !existing.is_expired() {
                return Err(ControllerError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found for {key}, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, &key.to_string());
        self.ensure_dir().await?;
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        write_synced(&self.lock_path(key), content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: e.to_string(),
            })?;

        info!(
            "Acquired lock for {key}: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    /// Releases the lock of one instance if `lock_id` still owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be read or removed.
    pub async fn release_lock(&self, key: &InstanceKey, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file(key).await? {
            if existing.lock_id == lock_id {
                fs::remove_file(self.lock_path(key)).await.map_err(|e| StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })?;
                info!("Released lock for {key}: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    /// Checks if the instance is locked by a live lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file is unreadable.
    pub async fn is_locked(&self, key: &InstanceKey) -> Result<bool> {
        Ok(self
            .read_lock_file(key)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await.map_err(|e| {
        ControllerError::State(StateError::Api {
            message: format!("Failed to create {}: {e}", path.display()),
        })
    })?;

    file.write_all(content).await.map_err(|e| {
        ControllerError::State(StateError::Api {
            message: format!("Failed to write {}: {e}", path.display()),
        })
    })?;

    file.sync_all().await.map_err(|e| {
        ControllerError::State(StateError::Api {
            message: format!("Failed to sync {}: {e}", path.display()),
        })
    })?;

    Ok(())
}

#[async_trait]
impl InstanceStore for LocalInstanceStore {
    async fn list(&self) -> Result<Vec<CueInstance>> {
        if self.instance_files.is_empty() {
            return self.list_records().await;
        }

        let mut instances = Vec::with_capacity(self.instance_files.len());
        for path in &self.instance_files {
            instances.push(self.load_merged(path).await?);
        }
        Ok(instances)
    }

    async fn get(&self, key: &InstanceKey) -> Result<Option<CueInstance>> {
        Ok(self.list().await?.into_iter().find(|i| &i.key() == key))
    }

    async fn patch_status(&self, key: &InstanceKey, status: &CueInstanceStatus) -> Result<()> {
        let mut instance = self
            .get(key)
            .await?
            .ok_or_else(|| StateError::NotFound { key: key.to_string() })?;
        instance.status = status.clone();
        self.write_record(&instance).await
    }

    async fn set_finalizer(&self, key: &InstanceKey, present: bool) -> Result<()> {
        let mut instance = self
            .get(key)
            .await?
            .ok_or_else(|| StateError::NotFound { key: key.to_string() })?;

        let finalizers = &mut instance.metadata.finalizers;
        let has = finalizers.iter().any(|f| f == crate::api::FINALIZER);
        if present == has {
            return Ok(());
        }
        if present {
            finalizers.push(String::from(crate::api::FINALIZER));
        } else {
            finalizers.retain(|f| f != crate::api::FINALIZER);
        }
        self.write_record(&instance).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
