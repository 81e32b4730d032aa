//! CLI command definitions for the `sagaflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod config;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and validate saga-style workflow definitions.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for engine logs, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file with the dry-run task adapter.
    Run {
        /// Path to the workflow definition (YAML or JSON).
        file: PathBuf,

        /// Caller inputs as a JSON object.
        #[arg(long, conflicts_with = "inputs_file")]
        inputs: Option<String>,

        /// Read caller inputs from a JSON file.
        #[arg(long)]
        inputs_file: Option<PathBuf>,

        /// Engine configuration file (TOML).
        #[arg(long, env = "SAGAFLOW_CONFIG")]
        config: Option<PathBuf>,

        /// Simulated latency of every task invocation, in milliseconds.
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// Print lifecycle events as they happen (to stderr with `--json`).
        #[arg(long)]
        events: bool,

        /// Export tracing spans through OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Validate workflow files or directories of workflow files.
    Validate {
        /// Files or directories to check.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the JSON Schema of a workflow document.
    Schema,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
