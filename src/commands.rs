//! CLI command handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use bpfsync_core::ProgramType;
use bpfsync_daemon::{DaemonAdapter, DaemonRpc, ListRequest, MapDiscovery, SocketDaemonClient};
use bpfsync_reconciler::{
    FileRecordStore, ReconcileOutcome, Reconciler, ReconcilerBuilder, RecordStore, Trigger,
};
use tracing::{info, warn};

use crate::cli::Commands;
use crate::config::BpfsyncConfig;

/// Execute a CLI command.
pub async fn execute_command(command: Commands, config: &BpfsyncConfig) -> Result<()> {
    match command {
        Commands::List {
            program_type,
            managed,
        } => cmd_list(config, program_type, managed).await,
        Commands::Reconcile { names } => cmd_reconcile(config, names).await,
        Commands::Sweep { program_type } => cmd_sweep(config, program_type).await,
    }
}

fn daemon_client(config: &BpfsyncConfig) -> Arc<SocketDaemonClient> {
    Arc::new(SocketDaemonClient::new(
        &config.socket_path,
        config.rpc_timeout,
    ))
}

async fn build_reconciler(
    config: &BpfsyncConfig,
    store: Arc<dyn RecordStore>,
) -> Result<Reconciler> {
    let daemon = DaemonAdapter::new(daemon_client(config), MapDiscovery::new(&config.map_root));
    let credentials = config.credentials().await?;
    ReconcilerBuilder::new()
        .with_store(store)
        .with_daemon(daemon)
        .with_credentials(Arc::new(credentials))
        .with_config(config.reconciler())
        .build()
        .context("Invalid reconciler configuration")
}

/// Print the daemon's programs as JSON lines.
async fn cmd_list(
    config: &BpfsyncConfig,
    program_type: Option<ProgramType>,
    managed: bool,
) -> Result<()> {
    let request = ListRequest {
        program_type: program_type.map(ProgramType::code),
        daemon_managed_only: managed.then_some(true),
        ..ListRequest::all()
    };
    let programs = daemon_client(config)
        .list(request)
        .await
        .with_context(|| format!("Failed to list programs via {}", config.socket_path.display()))?;

    for program in &programs {
        println!("{}", serde_json::to_string(program)?);
    }
    info!(count = programs.len(), "Listed programs");
    Ok(())
}

/// Run one pass per named record, or per stored record.
async fn cmd_reconcile(config: &BpfsyncConfig, names: Vec<String>) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(FileRecordStore::new(&config.records_path));
    let names = if names.is_empty() {
        store
            .list()
            .await
            .context("Failed to list records")?
            .into_iter()
            .map(|r| r.name)
            .collect()
    } else {
        names
    };
    let triggers: Vec<Trigger> = names.into_iter().map(Trigger::new).collect();

    let reconciler = build_reconciler(config, store).await?;
    let results = reconciler.reconcile_all(&triggers).await;

    let mut failures = 0usize;
    for (trigger, result) in results {
        match result {
            Ok(ReconcileOutcome::Done) => println!("{}\tdone", trigger.name),
            Ok(ReconcileOutcome::Requeue { after }) => {
                println!("{}\trequeue after {}s", trigger.name, after.as_secs());
            }
            Err(err) => {
                warn!(name = %trigger.name, error = %err, "Reconciliation failed");
                println!("{}\tfailed: {err}", trigger.name);
                failures = failures.saturating_add(1);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} record(s) failed to reconcile");
    }
    Ok(())
}

/// Unload programs of a type that no record accounts for.
async fn cmd_sweep(config: &BpfsyncConfig, program_type: ProgramType) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(FileRecordStore::new(&config.records_path));
    let reconciler = build_reconciler(config, store).await?;
    let unloaded = reconciler
        .sweep_orphans(program_type)
        .await
        .with_context(|| format!("Failed to sweep {program_type} programs"))?;

    for kernel_id in &unloaded {
        println!("{kernel_id}");
    }
    info!(%program_type, count = unloaded.len(), "Sweep complete");
    Ok(())
}
