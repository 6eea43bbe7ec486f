//! Instance building.
//!
//! This module turns an extracted artifact plus the build parameters of an
//! instance into an ordered list of manifests:
//! - Root/path resolution inside the artifact tree
//! - Tag merging
//! - Evaluation through an [`Evaluator`]
//! - Splitting of the YAML stream into resource documents

mod evaluator;
mod tags;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::CueInstanceSpec;
use crate::config::escapes_root;
use crate::error::BuildError;
use crate::manifest::Manifest;

pub use evaluator::{CueCliEvaluator, Evaluation, Evaluator};
#[cfg(test)]
pub use evaluator::MockEvaluator;
pub use tags::merge_tags;

/// Builds instances with an evaluator.
#[derive(Clone)]
pub struct InstanceBuilder {
    evaluator: Arc<dyn Evaluator>,
}

impl InstanceBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self { evaluator }
    }

    /// Resolves the module root inside the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidPath`] when `root` escapes the artifact or does
    /// not exist.
    pub fn module_root(
        artifact: &Path,
        root: Option<&str>,
    ) -> std::result::Result<PathBuf, BuildError> {
        let Some(root) = root.filter(|r| !r.is_empty()) else {
            return Ok(artifact.to_path_buf());
        };
        if escapes_root(root) {
            return Err(BuildError::InvalidPath {
                path: root.to_string(),
                message: String::from("path escapes the artifact tree"),
            });
        }
        let resolved = artifact.join(root);
        if !resolved.is_dir() {
            return Err(BuildError::InvalidPath {
                path: root.to_string(),
                message: String::from("directory not found in artifact"),
            });
        }
        Ok(resolved)
    }

    /// Returns the instance argument, `./path` or `./path:package`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidPath`] when `path` escapes the module root.
    pub fn package_path(
        path: Option<&str>,
        package: Option<&str>,
    ) -> std::result::Result<String, BuildError> {
        let path = path.filter(|p| !p.is_empty()).unwrap_or(".");
        if escapes_root(path) {
            return Err(BuildError::InvalidPath {
                path: path.to_string(),
                message: String::from("path escapes the module root"),
            });
        }

        let trimmed = path.trim_end_matches('/');
        let mut relative = if trimmed == "." || trimmed.starts_with("./") {
            trimmed.to_string()
        } else {
            format!("./{trimmed}")
        };
        if let Some(package) = package.filter(|p| !p.is_empty()) {
            relative.push(':');
            relative.push_str(package);
        }
        Ok(relative)
    }

    /// Evaluates the instance described by `spec` against an extracted artifact.
    ///
    /// # Errors
    ///
    /// Returns an error when a path is invalid, evaluation fails, or the output
    /// is not a set of resource documents.
    pub async fn build(
        &self,
        artifact: &Path,
        spec: &CueInstanceSpec,
    ) -> std::result::Result<Vec<Manifest>, BuildError> {
        let request = Evaluation {
            module_root: Self::module_root(artifact, spec.root.as_deref())?,
            package_path: Self::package_path(spec.path.as_deref(), spec.package.as_deref())?,
            tags: merge_tags(&spec.tags, &spec.tag_vars),
            exprs: spec.exprs.clone(),
        };
        debug!(package = %request.package_path, tags = request.tags.len(), "Evaluating instance");

        let output = self.evaluator.evaluate(&request).await?;
        let manifests = parse_documents(&output)?;
        info!("Built {} resources", manifests.len());
        Ok(manifests)
    }
}

/// Splits a YAML stream into manifests.
///
/// A document may be a single object, a sequence of objects, or a `kind: List`
/// wrapper with `items`. Null documents are skipped.
///
/// # Errors
///
/// Returns [`BuildError::InvalidDocument`] for unparsable or non-resource documents.
pub fn parse_documents(stream: &str) -> std::result::Result<Vec<Manifest>, BuildError> {
    let mut manifests = Vec::new();

    for (doc_index, document) in serde_yaml::Deserializer::from_str(stream).enumerate() {
        let value =
            serde_yaml::Value::deserialize(document).map_err(|e| BuildError::InvalidDocument {
                index: doc_index,
                message: e.to_string(),
            })?;
        for object in flatten(value) {
            let index = manifests.len();
            let json = serde_json::to_value(&object).map_err(|e| BuildError::InvalidDocument {
                index,
                message: e.to_string(),
            })?;
            manifests.push(Manifest::from_value(index, json)?);
        }
    }

    Ok(manifests)
}

fn flatten(value: serde_yaml::Value) -> Vec<serde_yaml::Value> {
    match value {
        serde_yaml::Value::Null => Vec::new(),
        serde_yaml::Value::Sequence(items) => items.into_iter().flat_map(flatten).collect(),
        serde_yaml::Value::Mapping(mut map) => {
            let is_list = map.get("kind").and_then(serde_yaml::Value::as_str) == Some("List");
            if is_list {
                if let Some(serde_yaml::Value::Sequence(items)) = map.remove("items") {
                    return items.into_iter().flat_map(flatten).collect();
                }
            }
            vec![serde_yaml::Value::Mapping(map)]
        }
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SourceReference, TagVar};
    use std::time::Duration;

    fn spec() -> CueInstanceSpec {
        CueInstanceSpec {
            interval: Duration::from_secs(300),
            source_ref: SourceReference {
                api_version: None,
                kind: String::from("GitRepository"),
                name: String::from("repo"),
                namespace: None,
            },
            root: None,
            path: Some(String::from("deploy")),
            package: Some(String::from("main")),
            tags: vec![TagVar::new("env", "prod")],
            tag_vars: vec![TagVar::new("env", "dev")],
            exprs: vec![],
            depends_on: vec![],
            prune: true,
            retry_interval: None,
            timeout: None,
            suspend: false,
            service_account_name: None,
            kube_config: None,
            force: false,
            validate: None,
        }
    }

    #[test]
    fn test_package_path() {
        assert_eq!(InstanceBuilder::package_path(None, None).unwrap(), ".");
        assert_eq!(InstanceBuilder::package_path(Some("deploy"), None).unwrap(), "./deploy");
        assert_eq!(
            InstanceBuilder::package_path(Some("./deploy/"), Some("main")).unwrap(),
            "./deploy:main"
        );
        assert!(InstanceBuilder::package_path(Some("../other"), None).is_err());
    }

    #[test]
    fn test_module_root() {
        let artifact = tempfile::tempdir().unwrap();
        std::fs::create_dir(artifact.path().join("cue")).unwrap();

        assert_eq!(InstanceBuilder::module_root(artifact.path(), None).unwrap(), artifact.path());
        assert_eq!(
            InstanceBuilder::module_root(artifact.path(), Some("./cue")).unwrap(),
            artifact.path().join("./cue")
        );
        assert!(matches!(
            InstanceBuilder::module_root(artifact.path(), Some("../escape")),
            Err(BuildError::InvalidPath { .. })
        ));
        assert!(matches!(
            InstanceBuilder::module_root(artifact.path(), Some("missing")),
            Err(BuildError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_parse_documents_shapes() {
        let stream = r"
apiVersion: v1
kind: Namespace
metadata:
  name: apps
---
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: a
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: b
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: Service
    metadata:
      name: web
---
";
        let manifests = parse_documents(stream).unwrap();
        let names: Vec<&str> = manifests.iter().map(Manifest::name).collect();
        assert_eq!(names, vec!["apps", "a", "b", "web"]);
    }

    #[test]
    fn test_parse_documents_rejects_non_resources() {
        let err = parse_documents("apiVersion: v1\nkind: ConfigMap\n").unwrap_err();
        assert!(matches!(err, BuildError::InvalidDocument { index: 0, .. }));
        assert!(parse_documents("just a string").is_err());
    }

    #[tokio::test]
    async fn test_build_passes_parameters() {
        let artifact = tempfile::tempdir().unwrap();
        let root = artifact.path().to_path_buf();

        let mut evaluator = MockEvaluator::new();
        evaluator
            .expect_evaluate()
            .withf(move |request| {
                request.module_root == root
                    && request.package_path == "./deploy:main"
                    && request.tags == vec![TagVar::new("env", "prod")]
            })
            .times(1)
            .returning(|_| {
                Ok(String::from("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n"))
            });

        let builder = InstanceBuilder::new(Arc::new(evaluator));
        let manifests = builder.build(artifact.path(), &spec()).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].name(), "settings");
    }

    #[tokio::test]
    async fn test_build_reports_evaluator_output_verbatim() {
        let artifact = tempfile::tempdir().unwrap();
        let mut evaluator = MockEvaluator::new();
        evaluator.expect_evaluate().returning(|_| {
            Err(BuildError::Evaluation {
                message: String::from("deploy: field not allowed: replicas"),
            })
        });

        let builder = InstanceBuilder::new(Arc::new(evaluator));
        let err = builder.build(artifact.path(), &spec()).await.unwrap_err();
        assert_eq!(err.to_string(), "deploy: field not allowed: replicas");
    }
}
