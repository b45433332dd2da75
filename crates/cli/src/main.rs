//! effm CLI - efficiency tracker delivery tools.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use effm_core::{
    millis_to_rfc3339, now_millis, parse_event_data, sanitize, Batch, ClientEnvironment, Event,
    EventId, EventKind, Metadata, SessionId, SharedConfig, TrackerConfig, Validator,
};
use effm_network::{HttpTransport, NetworkManager};
use effm_storage::{open_adapter, StorageManager};
use effm_tracker::Tracker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "effm")]
#[command(about = "Efficiency tracker delivery tools", long_about = None)]
struct Cli {
    /// Tracker configuration (JSON)
    #[arg(long, global = true, default_value = "effm.json")]
    config: PathBuf,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the events API health endpoint
    Health,
    /// Inspect or clear locally stored batches
    Stored {
        #[command(subcommand)]
        command: StoredCommands,
    },
    /// Resend stored batches now
    Drain,
    /// Send one event
    Emit {
        /// Event kind (annotation, performance, interaction, backend_computation,
        /// task_status, error, tool_efficiency)
        kind: String,
        /// Kind-specific fields as a JSON object
        #[arg(long, default_value = "{}")]
        fields: String,
    },
}

#[derive(Subcommand)]
enum StoredCommands {
    /// List stored batches, oldest first
    List,
    /// Show storage usage
    Stats,
    /// Delete every stored batch
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = TrackerConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Health => {
            let network = network(&config);
            let report = network.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                bail!("events API at {} is unhealthy", config.api_endpoint);
            }
        }
        Commands::Stored { command } => {
            let storage = storage(&config).await?;
            match command {
                StoredCommands::List => {
                    let records = storage.records().await.context("Failed to read stored batches")?;
                    println!("Stored batches ({})", records.len());
                    for record in records {
                        println!(
                            "  {} | {} | {} events | batch {}",
                            record.key,
                            millis_to_rfc3339(record.stored_at),
                            record.batch.len(),
                            record.batch.batch_id(),
                        );
                    }
                }
                StoredCommands::Stats => {
                    let stats = storage.stats().await.context("Failed to read storage stats")?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                StoredCommands::Clear => {
                    let cleared = storage.clear().await.context("Failed to clear storage")?;
                    println!("Cleared {} stored batches", cleared);
                }
            }
        }
        Commands::Drain => {
            let tracker = Tracker::builder(config)
                .build()
                .await
                .context("Failed to build tracker")?;
            let outcome = tracker.retry_stored_events().await;
            println!(
                "Resent {} events, removed {} batches",
                outcome.events_delivered, outcome.batches_removed
            );
            if let Some(e) = outcome.stopped_by {
                bail!("drain stopped early: {}", e);
            }
        }
        Commands::Emit { kind, fields } => {
            let kind: EventKind = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let fields: Metadata =
                serde_json::from_str(&fields).context("--fields must be a JSON object")?;
            let event = build_event(&config, kind, fields)?;

            let network = network(&config);
            match network.send_event(&event).await {
                Ok(delivery) => {
                    println!("Sent {} ({} attempts)", event.event_id, delivery.attempts);
                }
                Err(e) if config.storage.enabled => {
                    warn!("Delivery failed: {}", e);
                    let storage = storage(&config).await?;
                    let env = ClientEnvironment::detect(config.tool_type, config.client_version.clone());
                    let stored = storage
                        .store_batch(&Batch::new(vec![event.clone()], env))
                        .await
                        .context("Delivery failed and the event could not be stored")?;
                    println!("Stored {} as {} for a later drain", event.event_id, stored.key);
                }
                Err(e) => bail!("delivery failed: {}", e),
            }
        }
    }

    Ok(())
}

fn network(config: &TrackerConfig) -> NetworkManager {
    let transport = Arc::new(HttpTransport::new(config.request_timeout()));
    NetworkManager::new(transport, SharedConfig::new(config.clone()))
}

async fn storage(config: &TrackerConfig) -> Result<StorageManager> {
    let adapter = open_adapter(&config.storage)
        .await
        .with_context(|| format!("Failed to open storage at {}", config.storage.path.display()))?;
    info!("Using {} storage", adapter.name());
    Ok(StorageManager::new(adapter, config.storage.max_bytes))
}

fn build_event(config: &TrackerConfig, kind: EventKind, fields: Metadata) -> Result<Event> {
    let data = parse_event_data(kind, fields).context("Invalid event fields")?;
    let event = sanitize(Event {
        event_id: EventId::new(config.tool_type),
        timestamp: now_millis(),
        user_id: config.user_id.clone(),
        project_id: config.project_id.clone(),
        task_id: config.task_id.clone(),
        tool_type: config.tool_type,
        session_id: SessionId::new(),
        data,
    });
    let validated = Validator::new(config.max_clock_skew_ms)
        .validate(event)
        .context("Event failed validation")?;
    for warning in &validated.warnings {
        warn!("{}", warning);
    }
    Ok(validated.event)
}
