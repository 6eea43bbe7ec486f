//! Error types for the CUE instance controller.
//!
//! This module provides the error hierarchy for every stage of a reconciliation
//! cycle: controller settings, instance storage, source resolution, evaluation,
//! schema validation and target-cluster access.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Controller settings errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Instance storage errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Source resolution errors.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Evaluation errors.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Schema validation errors.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Target cluster errors.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Controller settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The settings file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
    },

    /// An environment override could not be interpreted.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Instance storage errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Instance not found.
    #[error("Instance not found: {key}")]
    NotFound {
        /// Namespaced name of the missing instance.
        key: String,
    },

    /// Stored data is corrupted or malformed.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Lock acquisition failed.
    #[error("Failed to acquire instance lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Lock is held by another process.
    #[error("Instance is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Kubernetes API error while reading or patching instances.
    #[error("Instance API error: {message}")]
    Api {
        /// Description of the API error.
        message: String,
    },
}

/// Source resolution errors. All of them are retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The referenced source object does not exist.
    #[error("Source '{reference}' not found")]
    NotFound {
        /// Reference that could not be resolved.
        reference: String,
    },

    /// The source exists but has not produced an artifact yet.
    #[error("Source '{reference}' is not ready: {message}")]
    NotReady {
        /// Reference that is not ready.
        reference: String,
        /// Why the artifact is unavailable.
        message: String,
    },

    /// Download, checksum verification or extraction failed.
    #[error("Failed to fetch artifact from {url}: {message}")]
    FetchFailed {
        /// Artifact URL.
        url: String,
        /// Description of the failure.
        message: String,
    },
}

/// Evaluation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// A configured path escapes the artifact tree or does not exist.
    #[error("Invalid module path '{path}': {message}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        message: String,
    },

    /// The evaluator reported an error; the message is its verbatim output.
    #[error("{message}")]
    Evaluation {
        /// Evaluator output.
        message: String,
    },

    /// The evaluator could not be started.
    #[error("Failed to run evaluator '{program}': {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Description of the failure.
        message: String,
    },

    /// The evaluation output is not a set of resource documents.
    #[error("Invalid document #{index}: {message}")]
    InvalidDocument {
        /// Position of the document in the output stream.
        index: usize,
        /// Description of the problem.
        message: String,
    },
}

/// Schema validation errors that abort a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// No checker is registered for the requested document type.
    #[error("No schema checker registered for type '{schema_type}'")]
    UnsupportedType {
        /// Requested type.
        schema_type: String,
    },

    /// The schema could not be loaded or compiled.
    #[error("Invalid schema '{schema}': {message}")]
    InvalidSchema {
        /// Schema reference.
        schema: String,
        /// Description of the problem.
        message: String,
    },

    /// One or more documents were rejected in `Fail` mode.
    #[error("{count} document(s) failed validation: {message}")]
    Rejected {
        /// Number of rejected documents.
        count: usize,
        /// Aggregated violations.
        message: String,
    },
}

/// Target cluster errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The patch attempted to change an immutable field.
    #[error("{resource}: immutable field change rejected: {message}")]
    ImmutableField {
        /// Resource that rejected the patch.
        resource: String,
        /// Server message.
        message: String,
    },

    /// Optimistic concurrency conflict (stale version token).
    #[error("{resource}: conflict: {message}")]
    Conflict {
        /// Resource with the conflict.
        resource: String,
        /// Server message.
        message: String,
    },

    /// The object or its API type does not exist.
    #[error("{resource}: not found")]
    NotFound {
        /// Missing resource.
        resource: String,
    },

    /// Any other API failure.
    #[error("{resource}: {message}")]
    Api {
        /// Resource the call was about.
        resource: String,
        /// Server or transport message.
        message: String,
    },

    /// A client for the acting identity could not be built.
    #[error("Failed to build client for {identity}: {message}")]
    Client {
        /// Description of the identity.
        identity: String,
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Source(_)
                | Self::Build(_)
                | Self::Cluster(_)
                | Self::State(
                    StateError::Api { .. }
                        | StateError::LockFailed { .. }
                        | StateError::LockedByOther { .. }
                )
        )
    }
}

impl ConfigError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl SourceError {
    /// Creates a fetch error.
    #[must_use]
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FetchFailed {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl ClusterError {
    /// Creates a generic API error.
    #[must_use]
    pub fn api(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Returns true for a not-found response.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let source = ControllerError::Source(SourceError::NotFound {
            reference: String::from("GitRepository/flux-system/repo"),
        });
        assert!(source.is_retryable());

        let config = ControllerError::Config(ConfigError::validation("workers must be positive"));
        assert!(!config.is_retryable());
    }

    #[test]
    fn test_build_error_is_verbatim() {
        let err = BuildError::Evaluation {
            message: String::from("foo: reference \"bar\" not found"),
        };
        assert_eq!(err.to_string(), "foo: reference \"bar\" not found");
    }
}
