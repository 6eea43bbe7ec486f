//! cue-controller CLI entrypoint.
//!
//! Runs the controller against a cluster, or single cycles and builds for
//! instance files on disk.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cue_flux_controller::api::CueInstance;
use cue_flux_controller::builder::{CueCliEvaluator, InstanceBuilder};
use cue_flux_controller::cli::{Cli, Commands, OutputFormatter};
use cue_flux_controller::cluster::KubeClusterConnector;
use cue_flux_controller::config::{
    ControllerSettings, InstanceValidator, LogFormat, SettingsParser, load_instance,
};
use cue_flux_controller::controller::Controller;
use cue_flux_controller::dependency::{
    DependencyGate, KubeReadinessProbe, ReadinessProbe, StoreReadinessProbe,
};
use cue_flux_controller::error::{ClusterError, ControllerError, Result};
use cue_flux_controller::reconciler::Reconciler;
use cue_flux_controller::source::{
    ArtifactFetcher, KubeSourceResolver, LocalSourceResolver, SourceResolver,
};
use cue_flux_controller::state::{
    InstanceStore, KubeInstanceStore, LocalInstanceStore, generate_holder_id, instance_resource,
};
use cue_flux_controller::validate::{CheckerRegistry, Validator};

use clap::Parser;
use kube::Client;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Namespace given to instance files that do not set one.
const DEFAULT_NAMESPACE: &str = "default";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match SettingsParser::new().resolve(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.verbose, settings.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli, settings: ControllerSettings) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Run { namespace, workers } => cmd_run(settings, namespace, workers).await,
        Commands::Reconcile {
            instance,
            state_dir,
            source,
        } => cmd_reconcile(&settings, &instance, state_dir, source, &formatter).await,
        Commands::Build { instance, source } => {
            cmd_build(&settings, &instance, &source, &formatter).await
        }
        Commands::Status { namespace, state_dir } => {
            cmd_status(namespace.as_deref(), state_dir, &formatter).await
        }
    }
}

/// Runs the controller until interrupted.
async fn cmd_run(
    settings: ControllerSettings,
    namespace: Option<String>,
    workers: Option<usize>,
) -> Result<()> {
    let mut settings = settings;
    if namespace.is_some() {
        settings = settings.with_namespace(namespace);
    }
    if let Some(workers) = workers {
        settings = settings.with_workers(workers);
    }

    let client = kube_client().await?;
    let store = KubeInstanceStore::new(client.clone(), settings.namespace.clone());
    let api = store.list_api();
    let resolver = kube_resolver(client.clone(), &settings)?;
    let probe = Arc::new(KubeReadinessProbe::new(client.clone()));
    let reconciler = build_reconciler(Arc::new(store), resolver, probe, client, &settings);

    Controller::new(reconciler, &settings)
        .run(api, instance_resource())
        .await?;
    info!("Controller stopped");
    Ok(())
}

/// Runs one cycle for an instance file under a local lock.
async fn cmd_reconcile(
    settings: &ControllerSettings,
    path: &Path,
    state_dir: PathBuf,
    source: Option<PathBuf>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let instance = read_instance(path)?;
    let key = instance.key();

    let store = Arc::new(LocalInstanceStore::with_base_dir(state_dir).with_instance_file(path));
    let client = kube_client().await?;
    let resolver: Arc<dyn SourceResolver> = match source {
        Some(dir) => {
            debug!("Using local source {}", dir.display());
            Arc::new(LocalSourceResolver::new(dir))
        }
        None => kube_resolver(client.clone(), settings)?,
    };
    let probe = Arc::new(StoreReadinessProbe::new(store.clone()));
    let reconciler = build_reconciler(store.clone(), resolver, probe, client, settings);

    let lock = store.acquire_lock(&key, &generate_holder_id()).await?;
    let result = reconciler.reconcile(&key).await;
    store.release_lock(&key, &lock.lock_id).await?;
    let result = result?;

    let output = formatter.format_reconciliation(&result);
    eprintln!("{output}");

    if result.is_success() {
        Ok(())
    } else {
        Err(ControllerError::internal(format!("reconciliation of {key} failed")))
    }
}

/// Evaluates and validates an instance against a local module tree.
async fn cmd_build(
    settings: &ControllerSettings,
    path: &Path,
    source: &Path,
    formatter: &OutputFormatter,
) -> Result<()> {
    let instance = read_instance(path)?;
    let builder = InstanceBuilder::new(Arc::new(CueCliEvaluator::new(settings.cue_binary.clone())));
    let manifests = builder.build(source, &instance.spec).await?;

    let manifests = match &instance.spec.validate {
        Some(validation) => {
            let root = InstanceBuilder::module_root(source, instance.spec.root.as_deref())?;
            let outcome = Validator::new(Arc::new(CheckerRegistry::with_defaults())).validate(
                &root,
                validation,
                manifests,
            )?;
            if !outcome.invalid.is_empty() {
                if let Some((_, reason, message)) = outcome.condition() {
                    warn!(reason = reason.as_str(), "{message}");
                }
            }
            outcome.manifests
        }
        None => manifests,
    };

    let output = formatter.format_manifests(&manifests);
    std::io::stdout().write_all(output.as_bytes())?;
    Ok(())
}

/// Shows instance conditions from a local state directory or the cluster.
async fn cmd_status(
    namespace: Option<&str>,
    state_dir: Option<PathBuf>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let instances = match state_dir {
        Some(dir) => LocalInstanceStore::with_base_dir(dir).list().await?,
        None => {
            let client = kube_client().await?;
            KubeInstanceStore::new(client, namespace.map(String::from)).list().await?
        }
    };

    let instances: Vec<CueInstance> = instances
        .into_iter()
        .filter(|i| namespace.is_none_or(|ns| i.metadata.namespace == ns))
        .collect();

    let output = formatter.format_status(&instances);
    eprintln!("{output}");
    Ok(())
}

// ============================================================================
// Helper functions
// ============================================================================

/// Loads and statically checks an instance file.
fn read_instance(path: &Path) -> Result<CueInstance> {
    let mut instance = load_instance(path)?;
    if instance.metadata.namespace.is_empty() {
        instance.metadata.namespace = String::from(DEFAULT_NAMESPACE);
    }
    InstanceValidator::new().validate(&instance)?;
    Ok(instance)
}

/// Creates a client from the in-cluster config or the local kubeconfig.
async fn kube_client() -> Result<Client> {
    Client::try_default().await.map_err(|e| {
        ClusterError::Client {
            identity: String::from("controller identity"),
            message: e.to_string(),
        }
        .into()
    })
}

/// Creates the resolver for Flux source objects.
fn kube_resolver(client: Client, settings: &ControllerSettings) -> Result<Arc<dyn SourceResolver>> {
    let fetcher = ArtifactFetcher::new(settings.artifact_dir.clone(), settings.http_timeout())?
        .with_source_host(settings.source_host.clone());
    Ok(Arc::new(KubeSourceResolver::new(client, fetcher)))
}

/// Wires a reconciler from its collaborators.
fn build_reconciler(
    store: Arc<dyn InstanceStore>,
    resolver: Arc<dyn SourceResolver>,
    probe: Arc<dyn ReadinessProbe>,
    client: Client,
    settings: &ControllerSettings,
) -> Reconciler {
    let evaluator = Arc::new(CueCliEvaluator::new(settings.cue_binary.clone()));
    let connector = Arc::new(KubeClusterConnector::new(client, settings.field_manager.clone()));

    Reconciler::new(
        store,
        resolver,
        InstanceBuilder::new(evaluator),
        connector,
        DependencyGate::new(probe),
    )
    .with_settings(settings)
}
