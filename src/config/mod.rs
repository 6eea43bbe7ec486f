//! Configuration module for the controller.
//!
//! This module handles all configuration-related functionality:
//! - Controller settings from `cue-controller.yaml`, `.env` and the environment
//! - Loading `CueInstance` documents from disk
//! - Static validation of instance specs

mod settings;
mod parser;
mod validator;

pub use settings::{ControllerSettings, DEFAULT_SETTINGS_FILES, LogFormat};
pub use parser::{SettingsParser, apply_env_overrides, find_settings_file, load_instance};
pub use validator::{FieldError, InstanceValidator, ValidationReport, escapes_root};
