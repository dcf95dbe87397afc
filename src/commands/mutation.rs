use clap::{Args, Subcommand};
use famsync_core::{EntityType, Mutation, MutationStatus, Operation, SyncEngine};

use super::{parse_payload, truncate, OutputFormat};

/// Queue a local change for the server
#[derive(Args)]
pub struct EnqueueCommand {
    /// Entity type (user, task, task_completion, redemption, family, notification_read)
    entity_type: String,

    /// Operation (insert, update, delete)
    operation: Operation,

    /// Record as a JSON object; must carry an `id`
    #[arg(long)]
    data: String,
}

impl EnqueueCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), Box<dyn std::error::Error>> {
        let payload = parse_payload(&self.data)?;
        let entity_type = EntityType::parse(&self.entity_type);
        let id = engine
            .enqueue_mutation(entity_type, self.operation, payload)
            .await?;

        println!("Queued: {}", id);
        println!("Pending: {}", engine.pending_count().await);
        Ok(())
    }
}

#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List queued mutations
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Only show mutations with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one mutation
    Show {
        /// Mutation ID
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Cancel a mutation that is not in flight
    Cancel {
        /// Mutation ID
        id: String,
    },

    /// Remove mutations from the queue
    Clear {
        /// Remove only permanently failed mutations
        #[arg(long, conflicts_with = "all")]
        failed: bool,

        /// Remove every mutation, synced or not
        #[arg(long)]
        all: bool,
    },
}

impl QueueCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            QueueSubcommand::List { format, status } => {
                let mut mutations = engine.list_mutations().await;
                if let Some(status) = status {
                    let wanted = status.to_lowercase();
                    mutations.retain(|m| status_label(m) == wanted);
                }

                if mutations.is_empty() {
                    println!("No mutations queued");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&mutations)?);
                    }
                    OutputFormat::Text => {
                        println!(
                            "{:<40}  {:<26}  {:>7}  ERROR",
                            "ID", "STATUS", "RETRIES"
                        );
                        println!("{}", "-".repeat(96));
                        for m in &mutations {
                            println!(
                                "{:<40}  {:<26}  {:>7}  {}",
                                truncate(&m.id, 40),
                                status_label(m),
                                m.retry_count,
                                m.last_error.as_deref().map(|e| truncate(e, 40)).unwrap_or_default()
                            );
                        }
                        println!("\nTotal: {} mutation(s)", mutations.len());
                    }
                }
                Ok(())
            }

            QueueSubcommand::Show { id, format } => match engine.get_mutation(id).await {
                Some(m) => {
                    match format {
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&m)?),
                        OutputFormat::Text => print_mutation(&m)?,
                    }
                    Ok(())
                }
                None => Err(format!("Mutation not found: {}", id).into()),
            },

            QueueSubcommand::Cancel { id } => {
                if engine.cancel_mutation(id).await? {
                    println!("Cancelled: {}", id);
                    Ok(())
                } else {
                    Err(format!("Mutation is not pending: {}", id).into())
                }
            }

            QueueSubcommand::Clear { failed, all } => {
                let removed = if *all {
                    engine.clear_all().await?
                } else if *failed {
                    engine.clear_failed().await?
                } else {
                    return Err("Specify --failed or --all".into());
                };
                println!("Removed {} mutation(s)", removed);
                Ok(())
            }
        }
    }
}

/// Status as shown to users; parked conflicts get their own label.
fn status_label(m: &Mutation) -> String {
    if m.needs_manual_resolution && m.status == MutationStatus::Failed {
        "needs_manual_resolution".to_string()
    } else {
        m.status.to_string()
    }
}

fn print_mutation(m: &Mutation) -> Result<(), Box<dyn std::error::Error>> {
    println!("ID:          {}", m.id);
    println!("Entity:      {} {}", m.entity_type, m.entity_id);
    println!("Operation:   {}", m.operation);
    println!("Status:      {}", status_label(m));
    println!("Retries:     {}", m.retry_count);
    println!("Created:     {}", m.created_at.to_rfc3339());
    println!("Next try:    {}", m.next_eligible_at.to_rfc3339());
    if let Some(error) = &m.last_error {
        println!("Last error:  {}", error);
    }
    if m.conflict_count > 0 {
        println!("Conflicts:   {}", m.conflict_count);
    }
    println!("\nPayload:");
    println!("{}", serde_json::to_string_pretty(&m.payload)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_status_label_for_parked_conflict() {
        let payload = json!({"id": "t1"}).as_object().cloned().unwrap();
        let mut m = Mutation::new(EntityType::Task, Operation::Update, payload, Utc::now()).unwrap();
        assert_eq!(status_label(&m), "pending");

        m.status = MutationStatus::Failed;
        assert_eq!(status_label(&m), "failed");

        m.needs_manual_resolution = true;
        assert_eq!(status_label(&m), "needs_manual_resolution");
    }
}
