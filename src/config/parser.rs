//! Settings and instance file loading.
//!
//! This module handles loading controller settings from YAML files and
//! environment variables, with proper precedence and error handling, and reading
//! `CueInstance` documents from disk for the local commands.

use crate::api::{CueInstance, duration};
use crate::error::{ConfigError, ControllerError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};
use validator::Validate;

use super::settings::{ControllerSettings, DEFAULT_SETTINGS_FILES, LogFormat};

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "CUE_CONTROLLER_";

/// Parser for controller settings.
#[derive(Debug, Default)]
pub struct SettingsParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl SettingsParser {
    /// Creates a new settings parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ControllerSettings> {
        let path = path.as_ref();
        info!("Loading settings from: {}", path.display());

        let content = read_file(path)?;
        self.parse_yaml(&content, Some(path))
    }

    /// Parses settings from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ControllerSettings> {
        debug!("Parsing YAML settings");

        if content.trim().is_empty() {
            return Ok(ControllerSettings::default());
        }

        serde_yaml::from_str(content).map_err(|e| {
            ControllerError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })
    }

    /// Resolves the effective settings.
    ///
    /// Precedence, lowest first: defaults, the settings file (when given or found
    /// in the working directory), `CUE_CONTROLLER_*` environment variables.
    /// The result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be loaded, an override cannot be
    /// interpreted or validation fails.
    pub fn resolve(&self, path: Option<&Path>) -> Result<ControllerSettings> {
        self.load_dotenv()?;

        let mut settings = match path {
            Some(path) => self.load_file(path)?,
            None => {
                let base = self.base_path.as_deref().unwrap_or_else(|| Path::new("."));
                match find_settings_file(base) {
                    Some(found) => self.load_file(found)?,
                    None => {
                        debug!("No settings file found, using defaults");
                        ControllerSettings::default()
                    }
                }
            }
        };

        apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;

        settings.validate().map_err(|e| ConfigError::validation(e.to_string()))?;
        Ok(settings)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ControllerError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `CUE_CONTROLLER_<FIELD>` overrides read through `lookup`.
///
/// # Errors
///
/// Returns an error if a variable holds a value of the wrong type.
pub fn apply_env_overrides<F>(settings: &mut ControllerSettings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |field: &str| {
        let name = format!("{ENV_PREFIX}{field}");
        lookup(&name).map(|value| (name, value))
    };

    if let Some((_, value)) = var("FIELD_MANAGER") {
        debug!("Overriding field_manager from environment");
        settings.field_manager = value;
    }
    if let Some((name, value)) = var("WORKERS") {
        debug!("Overriding workers from environment");
        settings.workers = parse_var(&name, &value)?;
    }
    if let Some((name, value)) = var("DEPENDENCY_REQUEUE") {
        debug!("Overriding dependency_requeue from environment");
        settings.dependency_requeue = parse_duration_var(&name, &value)?;
    }
    if let Some((name, value)) = var("RESYNC_INTERVAL") {
        debug!("Overriding resync_interval from environment");
        settings.resync_interval = parse_duration_var(&name, &value)?;
    }
    if let Some((name, value)) = var("MAX_CONFLICT_RETRIES") {
        debug!("Overriding max_conflict_retries from environment");
        settings.max_conflict_retries = parse_var(&name, &value)?;
    }
    if let Some((_, value)) = var("ARTIFACT_DIR") {
        debug!("Overriding artifact_dir from environment");
        settings.artifact_dir = PathBuf::from(value);
    }
    if let Some((name, value)) = var("HTTP_TIMEOUT_SECS") {
        debug!("Overriding http_timeout_secs from environment");
        settings.http_timeout_secs = parse_var(&name, &value)?;
    }
    if let Some((_, value)) = var("CUE_BINARY") {
        debug!("Overriding cue_binary from environment");
        settings.cue_binary = value;
    }
    if let Some((_, value)) = var("SOURCE_HOST") {
        debug!("Overriding source_host from environment");
        settings.source_host = Some(value).filter(|v| !v.is_empty());
    }
    if let Some((_, value)) = var("NAMESPACE") {
        debug!("Overriding namespace from environment");
        settings.namespace = Some(value).filter(|v| !v.is_empty());
    }
    if let Some((name, value)) = var("LOG_FORMAT") {
        settings.log_format = match value.to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            _ => return Err(invalid_var(&name, &value)),
        };
    }

    Ok(())
}

/// Reads a `CueInstance` document from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid instance.
pub fn load_instance(path: impl AsRef<Path>) -> Result<CueInstance> {
    let path = path.as_ref();
    let content = read_file(path)?;
    let instance: CueInstance = serde_yaml::from_str(&content).map_err(|e| {
        ControllerError::Config(ConfigError::ParseError {
            message: format!("Invalid CueInstance: {e}"),
            location: Some(path.display().to_string()),
        })
    })?;
    debug!("Loaded instance {} from {}", instance.key(), path.display());
    Ok(instance)
}

/// Finds a settings file in the given directory or its parents.
#[must_use]
pub fn find_settings_file(start_dir: impl AsRef<Path>) -> Option<PathBuf> {
    let mut current = start_dir.as_ref().to_path_buf();

    loop {
        for filename in DEFAULT_SETTINGS_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found settings file: {}", candidate.display());
                return Some(candidate);
            }
        }

        if !current.pop() {
            return None;
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ControllerError::Config(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }));
    }

    std::fs::read_to_string(path).map_err(|e| {
        ControllerError::Config(ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })
    })
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid_var(name, value))
}

fn parse_duration_var(name: &str, value: &str) -> Result<std::time::Duration> {
    duration::parse(value).map_err(|_| invalid_var(name, value))
}

fn invalid_var(name: &str, value: &str) -> ControllerError {
    ControllerError::Config(ConfigError::InvalidEnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_parse_partial_settings() {
        let yaml = r"
workers: 8
dependency_requeue: 1m
log_format: json
";
        let settings = SettingsParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.dependency_requeue, Duration::from_secs(60));
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.field_manager, "cue-controller");
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = SettingsParser::new().parse_yaml("  \n", None).unwrap();
        assert_eq!(settings, ControllerSettings::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CUE_CONTROLLER_WORKERS", "2"),
            ("CUE_CONTROLLER_RESYNC_INTERVAL", "10m"),
            ("CUE_CONTROLLER_SOURCE_HOST", "localhost:9090"),
        ]);
        let mut settings = ControllerSettings::default();
        apply_env_overrides(&mut settings, |name| vars.get(name).map(ToString::to_string)).unwrap();
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.resync_interval, Duration::from_secs(600));
        assert_eq!(settings.source_host.as_deref(), Some("localhost:9090"));
    }

    #[test]
    fn test_invalid_env_override() {
        let mut settings = ControllerSettings::default();
        let err = apply_env_overrides(&mut settings, |name| {
            (name == "CUE_CONTROLLER_WORKERS").then(|| String::from("many"))
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Config(ConfigError::InvalidEnvVar { ref name, .. })
                if name == "CUE_CONTROLLER_WORKERS"
        ));
    }

    #[test]
    fn test_resolve_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue-controller.yaml");
        std::fs::write(&path, "workers: 0\n").unwrap();

        let result = SettingsParser::new().with_base_path(dir.path()).resolve(Some(&path));
        assert!(matches!(
            result,
            Err(ControllerError::Config(ConfigError::ValidationError { .. }))
        ));
    }

    #[test]
    fn test_find_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("cue-controller.yaml"), "workers: 2\n").unwrap();

        assert_eq!(find_settings_file(&nested), Some(dir.path().join("cue-controller.yaml")));
    }

    #[test]
    fn test_load_instance_missing_file() {
        let result = load_instance("/nonexistent/instance.yaml");
        assert!(matches!(result, Err(ControllerError::Config(ConfigError::FileNotFound { .. }))));
    }
}
