//! Instance store trait definition.
//!
//! This module defines the common interface for reading instances and
//! persisting their status.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::api::{CueInstance, CueInstanceStatus, InstanceKey};
use crate::error::Result;

/// Trait for instance storage backends.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Lists every instance visible to the controller.
    async fn list(&self) -> Result<Vec<CueInstance>>;

    /// Reads one instance.
    ///
    /// Returns `None` if the instance does not exist.
    async fn get(&self, key: &InstanceKey) -> Result<Option<CueInstance>>;

    /// Replaces the status of an instance.
    async fn patch_status(&self, key: &InstanceKey, status: &CueInstanceStatus) -> Result<()>;

    /// Adds (`present = true`) or removes the controller finalizer.
    async fn set_finalizer(&self, key: &InstanceKey, present: bool) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl InstanceStore for Box<dyn InstanceStore> {
    async fn list(&self) -> Result<Vec<CueInstance>> {
        (**self).list().await
    }

    async fn get(&self, key: &InstanceKey) -> Result<Option<CueInstance>> {
        (**self).get(key).await
    }

    async fn patch_status(&self, key: &InstanceKey, status: &CueInstanceStatus) -> Result<()> {
        (**self).patch_status(key, status).await
    }

    async fn set_finalizer(&self, key: &InstanceKey, present: bool) -> Result<()> {
        (**self).set_finalizer(key, present).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
