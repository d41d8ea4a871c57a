//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - status: per-status counts for the repository namespace
//! - run-once: one cycle, or exactly one issue
//! - daemon: continuous loop until interrupted
//! - doctor: readiness checks
//! - clean: reset workspaces, run artifacts and the store

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Scryer - turns labeled GitHub issues into draft pull requests
#[derive(Parser, Debug)]
#[command(name = "scryer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository to operate on (defaults to the enclosing git repository)
    #[arg(long, global = true)]
    pub repo_root: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Show tracked issue counts by status
    Status,

    /// Recover, then run a single cycle
    RunOnce {
        /// Process exactly this issue number
        #[arg(short, long)]
        issue: Option<u64>,
    },

    /// Run cycles until SIGINT/SIGTERM
    Daemon,

    /// Check that every dependency is ready
    Doctor,

    /// Remove workspaces, run artifacts and stored state for this repository
    Clean {
        /// Clean even while leases are live
        #[arg(short, long)]
        force: bool,
    },
}
