//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cue-controller - Builds CUE instances from Flux sources and applies them.
#[derive(Parser, Debug)]
#[command(name = "cue-controller")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the controller settings file.
    #[arg(short, long, global = true, env = "CUE_CONTROLLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller against the cluster.
    Run {
        /// Only watch instances in this namespace.
        #[arg(short, long)]
        namespace: Option<String>,

        /// Number of concurrent workers.
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Run one reconciliation cycle for an instance file.
    Reconcile {
        /// Path to the `CueInstance` YAML file.
        instance: PathBuf,

        /// Directory where status and locks are kept.
        #[arg(long, default_value = ".cue-controller")]
        state_dir: PathBuf,

        /// Use a local directory as the source instead of the cluster.
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Evaluate and validate an instance locally and print the manifests.
    Build {
        /// Path to the `CueInstance` YAML file.
        instance: PathBuf,

        /// Directory holding the CUE module tree.
        #[arg(long)]
        source: PathBuf,
    },

    /// Show the conditions of instances.
    Status {
        /// Only show instances in this namespace.
        #[arg(short, long)]
        namespace: Option<String>,

        /// Read status from a local state directory instead of the cluster.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

/// Parses command-line arguments.
#[must_use]
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reconcile() {
        let cli = Cli::try_parse_from([
            "cue-controller",
            "reconcile",
            "app.yaml",
            "--source",
            "./module",
            "--output",
            "json",
        ])
        .unwrap();

        assert!(matches!(cli.output, OutputFormat::Json));
        match cli.command {
            Commands::Reconcile { instance, state_dir, source } => {
                assert_eq!(instance, PathBuf::from("app.yaml"));
                assert_eq!(state_dir, PathBuf::from(".cue-controller"));
                assert_eq!(source, Some(PathBuf::from("./module")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_build_requires_source() {
        assert!(Cli::try_parse_from(["cue-controller", "build", "app.yaml"]).is_err());
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["cue-controller", "run", "-n", "apps", "-w", "8"]).unwrap();
        match cli.command {
            Commands::Run { namespace, workers } => {
                assert_eq!(namespace.as_deref(), Some("apps"));
                assert_eq!(workers, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
