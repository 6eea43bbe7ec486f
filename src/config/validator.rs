//! Static checks of `CueInstance` specs.
//!
//! These checks run before a cycle starts so that malformed specs are reported
//! with a precise field path instead of failing half-way through the pipeline.

use crate::api::{CueInstance, TagVar};
use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use std::path::{Component, Path};
use tracing::{debug, warn};

/// Validator for instance specs.
#[derive(Debug, Default)]
pub struct InstanceValidator;

/// Validation result containing all findings.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// List of validation errors.
    pub errors: Vec<FieldError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl InstanceValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an instance spec.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings are logged.
    pub fn validate(&self, instance: &CueInstance) -> Result<ValidationReport> {
        let report = self.check(instance);

        for warning in &report.warnings {
            warn!(instance = %instance.key(), "{warning}");
        }

        match report.errors.first() {
            None => {
                debug!(instance = %instance.key(), "Instance spec validation passed");
                Ok(report)
            }
            Some(first) => {
                Err(ConfigError::validation(format!("{}: {}", first.field, first.message)).into())
            }
        }
    }

    /// Collects every finding without failing.
    #[must_use]
    pub fn check(&self, instance: &CueInstance) -> ValidationReport {
        let mut report = ValidationReport::default();
        let spec = &instance.spec;

        if instance.metadata.name.is_empty() {
            report.error("metadata.name", "name cannot be empty");
        }
        if spec.interval.is_zero() {
            report.error("spec.interval", "interval must be greater than zero");
        }
        if spec.source_ref.kind.is_empty() || spec.source_ref.name.is_empty() {
            report.error("spec.sourceRef", "kind and name are required");
        }

        for (field, value) in [("spec.root", &spec.root), ("spec.path", &spec.path)] {
            if let Some(value) = value {
                if escapes_root(value) {
                    report.error(field, &format!("path '{value}' escapes the artifact tree"));
                }
            }
        }

        Self::check_tags("spec.tags", &spec.tags, &mut report);
        Self::check_tags("spec.tagVars", &spec.tag_vars, &mut report);

        for (i, expr) in spec.exprs.iter().enumerate() {
            if expr.trim().is_empty() {
                report.error(&format!("spec.expressions[{i}]"), "expression cannot be empty");
            }
        }

        for (i, dep) in spec.depends_on.iter().enumerate() {
            if dep.name.is_empty() {
                report.error(
                    &format!("spec.dependsOn[{i}].name"),
                    "dependency name cannot be empty",
                );
            }
        }

        if let Some(validate) = &spec.validate {
            if validate.schema.trim().is_empty() {
                report.error("spec.validate.schema", "schema is required");
            }
        }

        if let Some(kube_config) = &spec.kube_config {
            if kube_config.secret_ref.name.is_empty() {
                report.error("spec.kubeConfig.secretRef.name", "secret name cannot be empty");
            } else if spec.service_account_name.is_some() {
                report.warnings.push(String::from(
                    "both kubeConfig and serviceAccountName are set; kubeConfig is used",
                ));
            }
        }

        report
    }

    fn check_tags(field: &str, tags: &[TagVar], report: &mut ValidationReport) {
        let mut seen = HashSet::new();
        for (i, tag) in tags.iter().enumerate() {
            if !is_valid_tag_name(&tag.name) {
                report.error(
                    &format!("{field}[{i}].name"),
                    &format!("invalid tag name '{}'", tag.name),
                );
            } else if !seen.insert(tag.name.as_str()) {
                report
                    .warnings
                    .push(format!("{field}: duplicate tag '{}', the last value wins", tag.name));
            }
        }
    }
}

impl ValidationReport {
    fn error(&mut self, field: &str, message: &str) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    /// Returns true when no errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Returns true when a relative path climbs above its starting directory or is absolute.
#[must_use]
pub fn escapes_root(path: &str) -> bool {
    let mut depth: usize = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return true,
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
    }
    false
}

/// Checks if a tag name is a valid CUE identifier.
fn is_valid_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(yaml: &str) -> CueInstance {
        serde_yaml::from_str(yaml).unwrap()
    }

    const BASE: &str = r"
metadata:
  name: app
  namespace: default
spec:
  interval: 5m
  sourceRef:
    kind: GitRepository
    name: repo
  prune: true
";

    #[test]
    fn test_valid_instance() {
        let report = InstanceValidator::new().validate(&instance(BASE)).unwrap();
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_escaping_path_is_rejected() {
        let mut inst = instance(BASE);
        inst.spec.path = Some(String::from("./deploy/../../etc"));
        let report = InstanceValidator::new().check(&inst);
        assert_eq!(report.errors[0].field, "spec.path");
        assert!(InstanceValidator::new().validate(&inst).is_err());
    }

    #[test]
    fn test_duplicate_tags_warn() {
        let mut inst = instance(BASE);
        inst.spec.tags = vec![TagVar::new("env", "dev"), TagVar::new("env", "prod")];
        let report = InstanceValidator::new().check(&inst);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_escapes_root() {
        assert!(!escapes_root("./deploy"));
        assert!(!escapes_root("a/../b"));
        assert!(escapes_root("../outside"));
        assert!(escapes_root("/etc"));
        assert!(escapes_root("a/../../b"));
    }

    #[test]
    fn test_tag_names() {
        assert!(is_valid_tag_name("env"));
        assert!(is_valid_tag_name("_private"));
        assert!(!is_valid_tag_name("1st"));
        assert!(!is_valid_tag_name(""));
        assert!(!is_valid_tag_name("a b"));
    }
}
