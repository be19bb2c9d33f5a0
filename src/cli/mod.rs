//! CLI module for the converge tool.
//!
//! This module provides the command-line interface: argument parsing and
//! output formatting.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
