//! CLI module for the controller.
//!
//! This module provides the command-line interface for running the controller
//! and for working with single instance files.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, parse_args};
pub use output::OutputFormatter;
