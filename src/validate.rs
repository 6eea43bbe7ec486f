//! Schema validation of built documents.
//!
//! Checkers are looked up by document type in a [`CheckerRegistry`] built once
//! at startup. Every document is checked before the mode decides what happens
//! to the invalid ones.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::api::{ConditionStatus, Reason, Validation, ValidationMode};
use crate::config::escapes_root;
use crate::error::ValidationError;
use crate::manifest::Manifest;

/// Maximum number of violations quoted per document.
const MAX_VIOLATIONS_PER_DOCUMENT: usize = 5;

/// Checks documents against a schema.
#[cfg_attr(test, automock)]
pub trait SchemaChecker: Send + Sync {
    /// Returns the violations of each document, in input order.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the schema cannot be compiled.
    fn check(
        &self,
        schema: &Value,
        documents: &[Manifest],
    ) -> std::result::Result<Vec<Vec<String>>, String>;
}

/// JSON-Schema checker.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaChecker;

impl SchemaChecker for JsonSchemaChecker {
    fn check(
        &self,
        schema: &Value,
        documents: &[Manifest],
    ) -> std::result::Result<Vec<Vec<String>>, String> {
        let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| e.to_string())?;

        let verdicts = documents
            .iter()
            .map(|document| {
                let value = document.to_value();
                match compiled.validate(&value) {
                    Ok(()) => Vec::new(),
                    Err(errors) => errors
                        .map(|e| {
                            let path = e.instance_path.to_string();
                            if path.is_empty() {
                                e.to_string()
                            } else {
                                format!("{path}: {e}")
                            }
                        })
                        .collect(),
                }
            })
            .collect();
        Ok(verdicts)
    }
}

/// Schema checkers keyed by document type.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    checkers: HashMap<String, Arc<dyn SchemaChecker>>,
}

impl CheckerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the JSON-Schema checker under `yaml` and `json`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let checker: Arc<dyn SchemaChecker> = Arc::new(JsonSchemaChecker);
        Self::new()
            .with_checker("yaml", Arc::clone(&checker))
            .with_checker("json", checker)
    }

    /// Registers a checker for a document type.
    #[must_use]
    pub fn with_checker(mut self, schema_type: &str, checker: Arc<dyn SchemaChecker>) -> Self {
        self.checkers.insert(schema_type.to_ascii_lowercase(), checker);
        self
    }

    /// Returns the checker registered for a document type.
    #[must_use]
    pub fn get(&self, schema_type: &str) -> Option<Arc<dyn SchemaChecker>> {
        self.checkers.get(&schema_type.to_ascii_lowercase()).cloned()
    }
}

/// A document that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDocument {
    /// `Kind/namespace/name` of the document.
    pub resource: String,
    /// Schema violations.
    pub violations: Vec<String>,
}

impl std::fmt::Display for InvalidDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown: Vec<&str> = self
            .violations
            .iter()
            .take(MAX_VIOLATIONS_PER_DOCUMENT)
            .map(String::as_str)
            .collect();
        write!(f, "{}: {}", self.resource, shown.join("; "))?;
        if self.violations.len() > MAX_VIOLATIONS_PER_DOCUMENT {
            write!(f, " (+{} more)", self.violations.len() - MAX_VIOLATIONS_PER_DOCUMENT)?;
        }
        Ok(())
    }
}

/// What validation decided for a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Mode that produced the outcome.
    pub mode: ValidationMode,
    /// Documents that proceed to apply.
    pub manifests: Vec<Manifest>,
    /// Documents reported as invalid. Empty in `Ignore` mode.
    pub invalid: Vec<InvalidDocument>,
}

impl ValidationOutcome {
    /// Returns the `Validated` condition to record, or `None` to remove it.
    #[must_use]
    pub fn condition(&self) -> Option<(ConditionStatus, Reason, String)> {
        if self.mode == ValidationMode::Ignore {
            return None;
        }
        if self.invalid.is_empty() {
            return Some((
                ConditionStatus::True,
                Reason::ValidationSucceeded,
                format!("{} document(s) passed validation", self.manifests.len()),
            ));
        }

        let reason = if self.mode == ValidationMode::Drop {
            Reason::ValidationDropped
        } else {
            Reason::ValidationAudit
        };
        Some((ConditionStatus::False, reason, summarize(&self.invalid)))
    }
}

fn summarize(invalid: &[InvalidDocument]) -> String {
    let details: Vec<String> = invalid.iter().map(ToString::to_string).collect();
    format!("{} document(s) failed validation: {}", invalid.len(), details.join("\n"))
}

/// Applies a validation policy to built documents.
#[derive(Clone)]
pub struct Validator {
    registry: Arc<CheckerRegistry>,
}

impl Validator {
    /// Creates a validator backed by a registry.
    #[must_use]
    pub const fn new(registry: Arc<CheckerRegistry>) -> Self {
        Self { registry }
    }

    /// Validates `manifests` according to `validation`.
    ///
    /// `module_root` anchors schema file paths.
    ///
    /// # Errors
    ///
    /// Outside `Ignore` mode, returns an error when no checker handles the type,
    /// the schema cannot be loaded, or any document is invalid in `Fail` mode.
    pub fn validate(
        &self,
        module_root: &Path,
        validation: &Validation,
        manifests: Vec<Manifest>,
    ) -> std::result::Result<ValidationOutcome, ValidationError> {
        if validation.mode == ValidationMode::Ignore {
            debug!("Validation mode is Ignore, skipping schema checks");
            return Ok(handle_ignore(manifests));
        }

        let checker = self
            .registry
            .get(&validation.type_)
            .ok_or_else(|| ValidationError::UnsupportedType {
                schema_type: validation.type_.clone(),
            })?;

        let schema = load_schema(module_root, &validation.schema)?;
        let verdicts = checker
            .check(&schema, &manifests)
            .map_err(|message| ValidationError::InvalidSchema {
                schema: validation.schema.clone(),
                message,
            })?;

        match validation.mode {
            ValidationMode::Ignore => Ok(handle_ignore(manifests)),
            ValidationMode::Audit => Ok(handle_audit(manifests, verdicts)),
            ValidationMode::Drop => Ok(handle_drop(manifests, verdicts)),
            ValidationMode::Fail => handle_fail(manifests, verdicts),
        }
    }
}

/// Pairs documents with their violations, keeping only the invalid ones.
fn collect_invalid(manifests: &[Manifest], verdicts: &[Vec<String>]) -> Vec<InvalidDocument> {
    manifests
        .iter()
        .zip(verdicts)
        .filter(|(_, violations)| !violations.is_empty())
        .map(|(manifest, violations)| InvalidDocument {
            resource: manifest.to_string(),
            violations: violations.clone(),
        })
        .collect()
}

fn handle_ignore(manifests: Vec<Manifest>) -> ValidationOutcome {
    ValidationOutcome {
        mode: ValidationMode::Ignore,
        manifests,
        invalid: Vec::new(),
    }
}

fn handle_audit(manifests: Vec<Manifest>, verdicts: Vec<Vec<String>>) -> ValidationOutcome {
    let invalid = collect_invalid(&manifests, &verdicts);
    for document in &invalid {
        warn!(resource = %document.resource, "Validation audit: {document}");
    }
    ValidationOutcome {
        mode: ValidationMode::Audit,
        manifests,
        invalid,
    }
}

fn handle_drop(manifests: Vec<Manifest>, verdicts: Vec<Vec<String>>) -> ValidationOutcome {
    let invalid = collect_invalid(&manifests, &verdicts);
    let kept: Vec<Manifest> = manifests
        .into_iter()
        .zip(verdicts)
        .filter(|(_, violations)| violations.is_empty())
        .map(|(manifest, _)| manifest)
        .collect();
    if !invalid.is_empty() {
        info!("Dropped {} invalid document(s), {} remain", invalid.len(), kept.len());
    }
    ValidationOutcome {
        mode: ValidationMode::Drop,
        manifests: kept,
        invalid,
    }
}

fn handle_fail(
    manifests: Vec<Manifest>,
    verdicts: Vec<Vec<String>>,
) -> std::result::Result<ValidationOutcome, ValidationError> {
    let invalid = collect_invalid(&manifests, &verdicts);
    if !invalid.is_empty() {
        let details: Vec<String> = invalid.iter().map(ToString::to_string).collect();
        return Err(ValidationError::Rejected {
            count: invalid.len(),
            message: details.join("\n"),
        });
    }
    Ok(ValidationOutcome {
        mode: ValidationMode::Fail,
        manifests,
        invalid,
    })
}

/// Loads a schema from a file below `module_root`, or parses it inline.
fn load_schema(module_root: &Path, schema: &str) -> std::result::Result<Value, ValidationError> {
    let invalid = |message: String| ValidationError::InvalidSchema {
        schema: schema.lines().next().unwrap_or_default().to_string(),
        message,
    };

    let trimmed = schema.trim();
    let is_single_line = !trimmed.contains('\n');
    if is_single_line && !trimmed.starts_with('{') {
        if escapes_root(trimmed) {
            return Err(invalid(String::from("schema path escapes the artifact tree")));
        }
        let path = module_root.join(trimmed);
        if path.is_file() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| invalid(format!("failed to read schema: {e}")))?;
            return parse_schema(&content).map_err(invalid);
        }
    }

    match parse_schema(trimmed) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) if is_single_line => Err(invalid(String::from("schema file not found in artifact"))),
        Ok(_) => Err(invalid(String::from("schema is not an object"))),
        Err(e) => Err(invalid(e)),
    }
}

fn parse_schema(content: &str) -> std::result::Result<Value, String> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    serde_json::to_value(yaml).map_err(|e| e.to_string())
}
