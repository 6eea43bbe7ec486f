//! Controller settings.
//!
//! Settings describe the controller process itself, not the instances it
//! reconciles. They are read from `cue-controller.yaml` and can be overridden
//! with `CUE_CONTROLLER_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::api::duration;

/// Settings of the controller process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(default)]
pub struct ControllerSettings {
    /// Field manager used for server-side apply.
    #[validate(length(min = 1, max = 128))]
    pub field_manager: String,
    /// Number of concurrent reconcile workers.
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
    /// Delay before re-checking dependencies that are not ready.
    #[serde(with = "duration")]
    #[validate(custom(function = "validate_positive"))]
    pub dependency_requeue: Duration,
    /// Period of the full resync of all instances.
    #[serde(with = "duration")]
    #[validate(custom(function = "validate_positive"))]
    pub resync_interval: Duration,
    /// Retries of an apply after an optimistic-concurrency conflict.
    #[validate(range(max = 10))]
    pub max_conflict_retries: u32,
    /// Directory where artifacts are downloaded and extracted.
    pub artifact_dir: PathBuf,
    /// Timeout of one artifact download.
    #[validate(range(min = 1, max = 3600))]
    pub http_timeout_secs: u64,
    /// Path or name of the `cue` binary.
    #[validate(length(min = 1))]
    pub cue_binary: String,
    /// Replaces the host of artifact URLs, e.g. `source-controller.flux-system.svc`.
    pub source_host: Option<String>,
    /// Restricts the controller to one namespace.
    pub namespace: Option<String>,
    /// Log output format.
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Default settings file names searched for.
pub const DEFAULT_SETTINGS_FILES: &[&str] = &["cue-controller.yaml", "cue-controller.yml"];

fn validate_positive(value: &Duration) -> std::result::Result<(), validator::ValidationError> {
    if value.is_zero() {
        return Err(validator::ValidationError::new("positive_duration"));
    }
    Ok(())
}

fn default_artifact_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cue-flux-controller")
        .join("artifacts")
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            field_manager: String::from("cue-controller"),
            workers: 4,
            dependency_requeue: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
            max_conflict_retries: 3,
            artifact_dir: default_artifact_dir(),
            http_timeout_secs: 60,
            cue_binary: String::from("cue"),
            source_host: None,
            namespace: None,
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerSettings {
    /// Returns the HTTP timeout as a duration.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Sets the number of workers.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the namespace restriction.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Sets the artifact directory.
    #[must_use]
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ControllerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.dependency_requeue, Duration::from_secs(30));
        assert!(settings.artifact_dir.ends_with("cue-flux-controller/artifacts"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let settings = ControllerSettings::default().with_workers(0);
        let errors = settings.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("workers"));
    }

    #[test]
    fn test_zero_resync_rejected() {
        let settings = ControllerSettings {
            resync_interval: Duration::ZERO,
            ..ControllerSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("resync_interval"));
    }
}
