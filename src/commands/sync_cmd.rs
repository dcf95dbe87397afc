//! Sync CLI commands for draining the queue and pulling remote state.

use clap::{Args, Subcommand};
use famsync_core::{ItemOutcome, SyncEngine, SyncError, SyncEvent, SyncResult};
use tokio::sync::broadcast::error::RecvError;

use super::OutputFormat;
use famsync::config::Config;
use famsync::sync::{build_engine, SetupError};

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration, connectivity and queue statistics
    Status,

    /// Pull records changed on the server into the local database
    Reconcile,

    /// Keep syncing in the foreground and print events until Ctrl-C
    Watch,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), SyncCommandError> {
        if !config.sync.is_configured() {
            print_setup_help();
            return match self.command {
                Some(SyncSubcommand::Status) => Ok(()),
                _ => Err(SetupError::NotConfigured.into()),
            };
        }

        let engine = build_engine(config).await?;
        match &self.command {
            None => self.sync(&engine).await,
            Some(SyncSubcommand::Status) => self.status(&engine, config).await,
            Some(SyncSubcommand::Reconcile) => self.reconcile(&engine).await,
            Some(SyncSubcommand::Watch) => self.watch(&engine).await,
        }
    }

    async fn sync(&self, engine: &SyncEngine) -> Result<(), SyncCommandError> {
        let state = engine.connectivity().check_now().await;
        tracing::debug!(%state, "Connectivity checked");

        let result = engine.force_sync_now().await;
        match self.format {
            OutputFormat::Json => println!("{}", to_json(&result)?),
            OutputFormat::Text => print_result(&result),
        }

        if result.success {
            Ok(())
        } else {
            Err(SyncCommandError::Incomplete(result.message))
        }
    }

    async fn status(&self, engine: &SyncEngine, config: &Config) -> Result<(), SyncCommandError> {
        let state = engine.connectivity().check_now().await;
        let statistics = engine.statistics().await;

        if let OutputFormat::Json = self.format {
            let value = serde_json::json!({
                "server_url": config.sync.server_url,
                "connectivity": state,
                "statistics": statistics,
            });
            println!("{}", to_json(&value)?);
            return Ok(());
        }

        println!("Sync Status");
        println!("===========");
        println!();
        println!("Server:       {}", config.sync.server_url.as_deref().unwrap_or_default());
        println!("Connectivity: {}", state);
        println!();

        let counts = statistics.counts;
        println!("Pending:      {}", counts.pending);
        println!("In flight:    {}", counts.processing);
        println!("Completed:    {}", counts.completed);
        println!("Failed:       {}", counts.failed);
        println!("Needs review: {}", counts.needs_manual_resolution);
        println!("Cancelled:    {}", counts.cancelled);
        println!();

        let never = || "never".to_string();
        println!(
            "Last sync:      {}",
            statistics
                .last_successful_sync_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(never)
        );
        println!(
            "Last reconcile: {}",
            statistics
                .last_reconciled_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(never)
        );
        Ok(())
    }

    async fn reconcile(&self, engine: &SyncEngine) -> Result<(), SyncCommandError> {
        let state = engine.connectivity().check_now().await;
        if !state.allows_sync() {
            return Err(SyncCommandError::Incomplete(format!(
                "server unreachable ({})",
                state
            )));
        }

        match engine.reconcile_now().await? {
            Some(report) => match self.format {
                OutputFormat::Json => println!("{}", to_json(&report)?),
                OutputFormat::Text => {
                    println!("Reconciled: {} record(s) updated", report.records_updated)
                }
            },
            None => println!("Reconciliation skipped"),
        }
        Ok(())
    }

    async fn watch(&self, engine: &SyncEngine) -> Result<(), SyncCommandError> {
        let mut events = engine.subscribe_events();
        let monitor = engine.connectivity().spawn();
        let scheduler = engine.spawn();
        let mut connectivity = engine.connectivity().subscribe();

        println!("Watching for sync activity (Ctrl-C to stop)");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.print_event(&event)?,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    if let OutputFormat::Text = self.format {
                        println!("connectivity: {}", state);
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        scheduler.shutdown().await;
        monitor.shutdown().await;
        println!("Stopped. {} mutation(s) pending", engine.pending_count().await);
        Ok(())
    }

    fn print_event(&self, event: &SyncEvent) -> Result<(), SyncCommandError> {
        if let OutputFormat::Json = self.format {
            println!("{}", serde_json::to_string(event).map_err(SyncCommandError::Output)?);
            return Ok(());
        }

        match event {
            SyncEvent::Queued { mutation_id, .. } => println!("queued      {}", mutation_id),
            SyncEvent::Started { run_id, pending } => {
                println!("run {:<5}   started ({} pending)", run_id, pending)
            }
            SyncEvent::ItemSynced { mutation_id, .. } => println!("synced      {}", mutation_id),
            SyncEvent::ConflictDetected {
                mutation_id,
                strategy,
                ..
            } => println!("conflict    {} ({})", mutation_id, strategy),
            SyncEvent::ConflictResolved {
                mutation_id,
                strategy,
                ..
            } => println!("resolved    {} ({})", mutation_id, strategy),
            SyncEvent::ItemFailed {
                mutation_id,
                error,
                retry_at,
                ..
            } => match retry_at {
                Some(at) => println!("retrying    {} at {}: {}", mutation_id, at.to_rfc3339(), error),
                None => println!("failed      {}: {}", mutation_id, error),
            },
            SyncEvent::Completed { run_id, synced } => {
                println!("run {:<5}   completed ({} synced)", run_id, synced)
            }
            SyncEvent::Failed { run_id, message, .. } => {
                println!("run {:<5}   failed: {}", run_id, message)
            }
            SyncEvent::Reconciled { records_updated } => {
                println!("reconciled  {} record(s)", records_updated)
            }
            SyncEvent::ReconcileFailed { message } => println!("reconcile failed: {}", message),
        }
        Ok(())
    }
}

fn print_result(result: &SyncResult) {
    for item in &result.items {
        let status = match &item.outcome {
            ItemOutcome::Synced => "✓ synced".to_string(),
            ItemOutcome::Resolved { strategy } => format!("✓ resolved ({})", strategy),
            ItemOutcome::Retrying { retry_count, .. } => format!("… retry #{}", retry_count),
            ItemOutcome::Failed { error } => format!("✗ {}", error),
            ItemOutcome::NeedsManualResolution => "! needs manual resolution".to_string(),
        };
        println!("  {:<40} {}", item.mutation_id, status);
    }
    if !result.items.is_empty() {
        println!();
    }
    println!("{}", result.message);
}

fn print_setup_help() {
    println!("Status: Not configured");
    println!();
    println!("To enable sync, add to your config file:");
    println!();
    println!("  sync:");
    println!("    server_url: \"http://localhost:8080\"");
    println!("    api_key: \"your-api-key\"");
    println!();
    println!("Or set environment variables:");
    println!("  FAMSYNC_SYNC_URL");
    println!("  FAMSYNC_SYNC_API_KEY");
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, SyncCommandError> {
    serde_json::to_string_pretty(value).map_err(SyncCommandError::Output)
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    Setup(SetupError),
    Engine(SyncError),
    /// The run finished but left work behind
    Incomplete(String),
    Output(serde_json::Error),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::Setup(e) => write!(f, "{}", e),
            SyncCommandError::Engine(e) => write!(f, "{}", e),
            SyncCommandError::Incomplete(message) => write!(f, "Sync incomplete: {}", message),
            SyncCommandError::Output(e) => write!(f, "Failed to render output: {}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::Setup(e) => Some(e),
            SyncCommandError::Engine(e) => Some(e),
            SyncCommandError::Incomplete(_) => None,
            SyncCommandError::Output(e) => Some(e),
        }
    }
}

impl From<SetupError> for SyncCommandError {
    fn from(e: SetupError) -> Self {
        SyncCommandError::Setup(e)
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::Engine(e)
    }
}
