use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, ConflictCommand, EnqueueCommand, QueueCommand, SyncCommand};
use famsync::config::Config;
use famsync::sync::build_engine;

#[derive(Parser)]
#[command(name = "famsync")]
#[command(version)]
#[command(about = "Offline-first sync for family tasks and rewards", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a local change for the server
    Enqueue(EnqueueCommand),

    /// Inspect and manage the mutation queue
    Queue(QueueCommand),

    /// Inspect and settle parked conflicts
    Conflicts(ConflictCommand),

    /// Sync with the server
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "famsync=warn,famsync_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Enqueue(cmd)) => {
            let engine = build_engine(&config).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Queue(cmd)) => {
            let engine = build_engine(&config).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Conflicts(cmd)) => {
            let engine = build_engine(&config).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Sync(cmd)) => {
            cmd.run(&config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
