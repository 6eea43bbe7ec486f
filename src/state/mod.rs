//! Instance storage module.
//!
//! This module provides the backends the controller reads instances from and
//! persists status to: the Kubernetes API, or local files with per-instance
//! lock protection.

mod store;
mod local;
mod kubernetes;
mod lock;

pub use store::InstanceStore;
#[cfg(test)]
pub use store::MockInstanceStore;
pub use local::LocalInstanceStore;
pub use kubernetes::{KubeInstanceStore, decode_instance, instance_resource};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
