use clap::{Args, Subcommand};
use famsync_core::{Mutation, Payload, SyncEngine};
use serde::Serialize;

use super::{parse_payload, OutputFormat};

/// Inspect and settle conflicts parked for manual resolution
#[derive(Args)]
pub struct ConflictCommand {
    #[command(subcommand)]
    pub command: ConflictSubcommand,
}

#[derive(Subcommand)]
pub enum ConflictSubcommand {
    /// List parked conflicts with both versions
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Supply the final record for a parked conflict
    Resolve {
        /// Mutation ID
        id: String,

        /// Final record as a JSON object
        #[arg(long, conflicts_with_all = ["use_local", "use_server"])]
        data: Option<String>,

        /// Keep the local version
        #[arg(long, conflicts_with = "use_server")]
        use_local: bool,

        /// Take the server's version
        #[arg(long)]
        use_server: bool,
    },
}

#[derive(Serialize)]
struct ParkedConflict<'a> {
    mutation_id: &'a str,
    entity_type: String,
    entity_id: &'a str,
    local: &'a Payload,
    remote: Option<&'a Payload>,
}

impl<'a> From<&'a Mutation> for ParkedConflict<'a> {
    fn from(m: &'a Mutation) -> Self {
        Self {
            mutation_id: &m.id,
            entity_type: m.entity_type.to_string(),
            entity_id: &m.entity_id,
            local: &m.payload,
            remote: m.remote_snapshot.as_ref(),
        }
    }
}

impl ConflictCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConflictSubcommand::List { format } => {
                let parked: Vec<Mutation> = engine
                    .list_mutations()
                    .await
                    .into_iter()
                    .filter(|m| m.needs_manual_resolution)
                    .collect();

                if parked.is_empty() {
                    println!("No conflicts awaiting resolution");
                    return Ok(());
                }

                let conflicts: Vec<ParkedConflict> = parked.iter().map(ParkedConflict::from).collect();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&conflicts)?);
                    }
                    OutputFormat::Text => {
                        for c in &conflicts {
                            println!("{} ({} {})", c.mutation_id, c.entity_type, c.entity_id);
                            println!("  local:  {}", serde_json::to_string(c.local)?);
                            match c.remote {
                                Some(remote) => println!("  server: {}", serde_json::to_string(remote)?),
                                None => println!("  server: (unavailable)"),
                            }
                            println!();
                        }
                        println!("Total: {} conflict(s)", conflicts.len());
                    }
                }
                Ok(())
            }

            ConflictSubcommand::Resolve {
                id,
                data,
                use_local,
                use_server,
            } => {
                let m = engine
                    .get_mutation(id)
                    .await
                    .ok_or_else(|| format!("Mutation not found: {}", id))?;

                if *use_server {
                    if m.remote_snapshot.is_none() {
                        return Err("No server version recorded for this conflict".into());
                    }
                    engine.resolve_manual_with_server(id).await?;
                    println!("Resolved: {} (kept server version)", id);
                    return Ok(());
                }

                let payload = if let Some(data) = data {
                    parse_payload(data)?
                } else if *use_local {
                    m.payload.clone()
                } else {
                    return Err("Specify --data, --use-local or --use-server".into());
                };

                engine.resolve_manual_conflict(id, payload).await?;
                println!("Resolved: {} (will be applied on next sync)", id);
                Ok(())
            }
        }
    }
}
