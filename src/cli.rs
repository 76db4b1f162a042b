//! CLI command definitions using clap.

use std::path::PathBuf;

use bpfsync_core::ProgramType;
use clap::{Parser, Subcommand};

/// bpfsync - eBPF program reconciler
#[derive(Parser, Debug)]
#[command(name = "bpfsync")]
#[command(version)]
#[command(about = "Reconciles declared eBPF program records against a loader daemon")]
#[command(
    long_about = "bpfsync keeps the programs a loader daemon holds in line with declared program records: loading, replacing and unloading programs, and reporting the outcome on each record's status."
)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List programs the daemon holds
    List {
        /// Only programs of this type
        #[arg(short = 't', long = "type")]
        program_type: Option<ProgramType>,

        /// Only programs the daemon itself loaded
        #[arg(short, long, default_value_t = false)]
        managed: bool,
    },

    /// Run a reconciliation pass for records
    Reconcile {
        /// Record names; every stored record when empty
        names: Vec<String>,
    },

    /// Unload daemon-managed programs no record accounts for
    Sweep {
        /// Program type to sweep
        #[arg(short = 't', long = "type")]
        program_type: ProgramType,
    },
}
