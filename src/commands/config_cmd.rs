use clap::{Args, Subcommand};

use super::OutputFormat;
use famsync::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "database_path: {}",
                            config.database_path.value.display()
                        );
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!(
                            "sync.server_url: {}",
                            config.sync.server_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "sync.api_key: {}",
                            if config.sync.api_key.is_some() { "(set)" } else { "(not set)" }
                        );
                        println!();

                        let engine = &config.engine;
                        println!("engine.batch_size: {}", engine.batch_size);
                        println!("engine.max_retries: {}", engine.max_retries);
                        println!("engine.base_delay_ms: {}", engine.base_delay_ms);
                        println!("engine.call_timeout_secs: {}", engine.call_timeout_secs);
                        println!("engine.periodic_sync_secs: {}", engine.periodic_sync_secs);
                        println!(
                            "engine.reconcile_interval_secs: {}",
                            engine.reconcile_interval_secs
                        );
                        println!();

                        let connectivity = &config.connectivity;
                        println!(
                            "connectivity.poll_interval_secs: {}",
                            connectivity.poll_interval_secs
                        );
                        println!(
                            "connectivity.slow_threshold_ms: {}",
                            connectivity.slow_threshold_ms
                        );
                    }
                }
                Ok(())
            }
        }
    }
}
