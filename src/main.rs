//! # bpfsync
//!
//! Entry point: parse the command line, load configuration, install tracing
//! and dispatch to a command handler.
//!
//! Logging goes to stderr and honours `RUST_LOG` (default `info`); command
//! output goes to stdout.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use anyhow::{Context, Result};
use bpfsync::cli::Cli;
use bpfsync::commands::execute_command;
use bpfsync::config::BpfsyncConfig;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = BpfsyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(socket = %config.socket_path.display(), records = %config.records_path.display(), "Configuration loaded");

    execute_command(cli.command, &config).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
