//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::api::{ConditionStatus, CueInstance, READY_CONDITION, VALIDATED_CONDITION};
use crate::manifest::Manifest;
use crate::reconciler::{Phase, ReconciliationResult};

use super::commands::OutputFormat;

/// Width of the message column in status tables.
const MESSAGE_WIDTH: usize = 60;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Instance row for table display.
#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Ready")]
    ready: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Revision")]
    revision: String,
    #[tabled(rename = "Message")]
    message: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the result of one cycle.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let headline = match result.phase {
                    Phase::Succeeded | Phase::Unchanged | Phase::Finalized => {
                        format!("{} {} {}", "✓".green(), result.instance, result.phase)
                    }
                    Phase::Failed => {
                        format!("{} {} {}", "✗".red(), result.instance, result.phase)
                    }
                    Phase::Waiting | Phase::Suspended | Phase::Gone => {
                        format!("{} {} {}", "•".yellow(), result.instance, result.phase)
                    }
                };

                let mut output = format!("{headline}\n\n");
                if let Some(reason) = result.reason {
                    let _ = writeln!(output, "   Reason:   {}", reason.as_str());
                }
                if let Some(revision) = &result.revision {
                    let _ = writeln!(output, "   Revision: {revision}");
                }
                let _ = writeln!(output, "   Applied:  {}", result.applied);
                let _ = writeln!(output, "   Deleted:  {}", result.deleted);
                if !result.message.is_empty() {
                    let _ = write!(output, "\n{}\n", result.message);
                }
                output
            }
        }
    }

    /// Formats the conditions of instances.
    #[must_use]
    pub fn format_status(&self, instances: &[CueInstance]) -> String {
        match self.format {
            OutputFormat::Json => {
                let rows: Vec<StatusJson> = instances.iter().map(StatusJson::from).collect();
                serde_json::to_string_pretty(&rows).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_status_text(instances),
        }
    }

    fn format_status_text(instances: &[CueInstance]) -> String {
        if instances.is_empty() {
            return String::from("No instances found.\n");
        }

        let rows: Vec<InstanceRow> = instances
            .iter()
            .map(|instance| {
                let ready = instance.ready_condition();
                InstanceRow {
                    namespace: instance.metadata.namespace.clone(),
                    name: instance.metadata.name.clone(),
                    ready: Self::format_condition_status(ready.map(|c| c.status)),
                    reason: ready.map(|c| c.reason.clone()).unwrap_or_default(),
                    revision: instance.status.last_applied_revision.clone(),
                    message: Self::truncate(
                        ready.map(|c| c.message.as_str()).unwrap_or_default(),
                        MESSAGE_WIDTH,
                    ),
                }
            })
            .collect();

        let mut output = Table::new(rows).to_string();
        output.push('\n');

        let ready = instances.iter().filter(|i| i.status.is_ready()).count();
        let _ = write!(output, "\n{ready}/{} instances ready\n", instances.len());
        output
    }

    fn format_condition_status(status: Option<ConditionStatus>) -> String {
        match status {
            Some(ConditionStatus::True) => "True".green().to_string(),
            Some(ConditionStatus::False) => "False".red().to_string(),
            Some(ConditionStatus::Unknown) => "Unknown".yellow().to_string(),
            None => String::from("-"),
        }
    }

    /// Formats built manifests as a YAML stream or a JSON array.
    #[must_use]
    pub fn format_manifests(&self, manifests: &[Manifest]) -> String {
        match self.format {
            OutputFormat::Json => {
                let values: Vec<serde_json::Value> =
                    manifests.iter().map(Manifest::to_value).collect();
                serde_json::to_string_pretty(&values).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for manifest in manifests {
                    output.push_str("---\n");
                    let yaml = serde_yaml::to_string(&manifest.to_value()).unwrap_or_default();
                    output.push_str(&yaml);
                }
                output
            }
        }
    }

    /// Truncates a string to `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        let first_line = s.lines().next().unwrap_or_default();
        if first_line.chars().count() <= max_len && first_line.len() == s.len() {
            first_line.to_string()
        } else {
            let kept: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct StatusJson {
    namespace: String,
    name: String,
    ready: Option<ConditionStatus>,
    reason: Option<String>,
    message: Option<String>,
    validated: Option<ConditionStatus>,
    last_applied_revision: String,
    last_attempted_revision: String,
    inventory: usize,
}

impl From<&CueInstance> for StatusJson {
    fn from(instance: &CueInstance) -> Self {
        let ready = instance.status.condition(READY_CONDITION);
        Self {
            namespace: instance.metadata.namespace.clone(),
            name: instance.metadata.name.clone(),
            ready: ready.map(|c| c.status),
            reason: ready.map(|c| c.reason.clone()),
            message: ready.map(|c| c.message.clone()),
            validated: instance.status.condition(VALIDATED_CONDITION).map(|c| c.status),
            last_applied_revision: instance.status.last_applied_revision.clone(),
            last_attempted_revision: instance.status.last_attempted_revision.clone(),
            inventory: instance.status.inventory.as_ref().map_or(0, |i| i.len()),
        }
    }
}
