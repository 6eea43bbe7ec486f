//! Module evaluation.
//!
//! The [`Evaluator`] trait hides how a CUE instance is turned into a YAML stream.
//! [`CueCliEvaluator`] shells out to `cue export`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::api::TagVar;
use crate::error::BuildError;

/// One evaluation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Directory of the CUE module root; the working directory of the evaluator.
    pub module_root: PathBuf,
    /// Instance path relative to the module root, e.g. `./deploy` or `./deploy:main`.
    pub package_path: String,
    /// Merged build tags.
    pub tags: Vec<TagVar>,
    /// Expressions to export instead of the whole instance.
    pub exprs: Vec<String>,
}

/// Evaluates CUE instances.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluates the request and returns a YAML document stream.
    async fn evaluate(&self, request: &Evaluation) -> std::result::Result<String, BuildError>;
}

/// Evaluator backed by the `cue` command line tool.
#[derive(Debug, Clone)]
pub struct CueCliEvaluator {
    binary: String,
}

impl CueCliEvaluator {
    /// Creates an evaluator running `binary`.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Returns the arguments passed to `cue`.
    #[must_use]
    pub fn arguments(request: &Evaluation) -> Vec<String> {
        let mut args = vec![String::from("export"), request.package_path.clone()];
        for tag in &request.tags {
            args.push(String::from("-t"));
            match &tag.value {
                Some(value) => args.push(format!("{}={value}", tag.name)),
                None => args.push(tag.name.clone()),
            }
        }
        for expr in &request.exprs {
            args.push(String::from("-e"));
            args.push(expr.clone());
        }
        args.push(String::from("--out"));
        args.push(String::from("yaml"));
        args
    }
}

impl Default for CueCliEvaluator {
    fn default() -> Self {
        Self::new("cue")
    }
}

#[async_trait]
impl Evaluator for CueCliEvaluator {
    async fn evaluate(&self, request: &Evaluation) -> std::result::Result<String, BuildError> {
        let args = Self::arguments(request);
        debug!(
            "Running {} {} in {}",
            self.binary,
            args.join(" "),
            request.module_root.display()
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .current_dir(&request.module_root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BuildError::Spawn {
                program: self.binary.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.binary, output.status)
            } else {
                stderr
            };
            return Err(BuildError::Evaluation { message });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|e| BuildError::Evaluation {
            message: format!("evaluator output is not UTF-8: {e}"),
        })?;
        trace!("Evaluator produced {} bytes", stdout.len());
        Ok(stdout)
    }
}
