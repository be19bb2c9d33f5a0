//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - declarative infrastructure reconciliation.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "CONVERGE_LOG_FORMAT")]
    pub log_format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the execution plan.
    Plan {
        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Concurrent provider operations (overrides the manifest).
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Read every recorded object back and update the state.
    Refresh,

    /// Check for changes made outside of converge.
    Drift,

    /// Inspect and edit the state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the full state.
    Show,

    /// List recorded instances.
    List,

    /// Mark an instance for replacement.
    Taint {
        /// Instance address (`type.name`).
        instance: String,
    },

    /// Clear a taint marker.
    Untaint {
        /// Instance address (`type.name`).
        instance: String,
    },

    /// Release the state lock.
    Unlock {
        /// Remove the lock even if another run holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
