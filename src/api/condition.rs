//! Status conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of the condition summarizing the cycle outcome.
pub const READY_CONDITION: &str = "Ready";

/// Type of the advisory condition written by schema validation.
pub const VALIDATED_CONDITION: &str = "Validated";

/// Maximum length of a condition message in bytes.
pub const MAX_CONDITION_MESSAGE_LENGTH: usize = 20_000;

/// Marker appended to truncated messages.
const TRUNCATION_MARKER: &str = "...";

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The outcome is not known yet.
    #[default]
    Unknown,
}

/// A single status condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Condition status.
    pub status: ConditionStatus,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// When the status last changed.
    pub last_transition_time: DateTime<Utc>,
}

/// Reasons written to conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    /// A cycle is running.
    Progressing,
    /// The last cycle applied and pruned successfully.
    ReconciliationSucceeded,
    /// A dependency is missing or not ready. Never written as a failure.
    WaitingOnDependency,
    /// The source could not be resolved or fetched.
    SourceUnavailable,
    /// Evaluation of the module failed.
    BuildFailed,
    /// Schema validation aborted the cycle.
    ValidationFailed,
    /// At least one document could not be applied.
    ApplyFailed,
    /// At least one stale resource could not be deleted.
    PruneFailed,
    /// The cycle deadline elapsed.
    Timeout,
    /// Invalid documents were reported but applied.
    ValidationAudit,
    /// Invalid documents were removed from the desired set.
    ValidationDropped,
    /// Every document passed validation.
    ValidationSucceeded,
}

impl Reason {
    /// Returns the reason as written to a condition.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Progressing => "Progressing",
            Self::ReconciliationSucceeded => "ReconciliationSucceeded",
            Self::WaitingOnDependency => "WaitingOnDependency",
            Self::SourceUnavailable => "SourceUnavailable",
            Self::BuildFailed => "BuildFailed",
            Self::ValidationFailed => "ValidationFailed",
            Self::ApplyFailed => "ApplyFailed",
            Self::PruneFailed => "PruneFailed",
            Self::Timeout => "Timeout",
            Self::ValidationAudit => "ValidationAudit",
            Self::ValidationDropped => "ValidationDropped",
            Self::ValidationSucceeded => "ValidationSucceeded",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(status)
    }
}

/// Truncates a message to `limit` bytes on a char boundary, appending `...` when cut.
#[must_use]
pub fn truncate_message(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut end = limit;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = String::with_capacity(end + TRUNCATION_MARKER.len());
    truncated.push_str(&message[..end]);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

impl Condition {
    /// Creates a condition stamped with the current time.
    #[must_use]
    pub fn new(type_: &str, status: ConditionStatus, reason: Reason, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: truncate_message(message, MAX_CONDITION_MESSAGE_LENGTH),
            last_transition_time: Utc::now(),
        }
    }

    /// Returns true when this condition is `True`.
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}
