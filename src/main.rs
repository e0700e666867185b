use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};

use stateset_commerce::{
    config,
    db,
    message_queue::{BusIngress, InMemoryMessageQueue, Message, MessageQueue},
    AppState,
};

#[derive(Parser)]
#[command(
    name = "stateset-commerce",
    about = "Inventory, order and payment-event processing",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create any missing tables and indexes
    SyncSchema,
    /// Publish newline-delimited provider events and process them through the worker pool
    Ingest {
        #[arg(help = "File with one JSON event envelope per line")]
        file: PathBuf,
    },
    /// List events claimed but never completed
    Unprocessed {
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    db::sync_schema(&pool)
        .await
        .context("failed to sync the database schema")?;
    let state = AppState::new(Arc::new(pool), cfg);

    match cli.command {
        Commands::SyncSchema => info!("Schema is up to date"),
        Commands::Ingest { file } => ingest(&state, file).await?,
        Commands::Unprocessed { limit } => unprocessed(&state, limit, cli.json).await?,
    }

    Ok(())
}

async fn ingest(state: &AppState, file: PathBuf) -> Result<()> {
    let contents = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let subject = state.config.event_subject.clone();
    let publish_subject = subject.trim_end_matches(".>").to_string() + ".ingest";
    let queue = Arc::new(InMemoryMessageQueue::new());
    let mut published = 0usize;
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        queue
            .publish(Message::new(publish_subject.clone(), line.as_bytes().to_vec()))
            .await
            .context("failed to publish event")?;
        published += 1;
    }

    let pool = Arc::new(state.worker_pool());
    let ingress = BusIngress::new(
        queue.clone(),
        state.pipeline.clone(),
        Arc::clone(&pool),
        subject,
    );
    let submitted = ingress.drain_once().await.context("failed to drain the bus")?;
    pool.shutdown().await;

    if submitted < published {
        warn!(
            published,
            submitted, "some lines could not be decoded and were dropped"
        );
    }
    println!("Submitted {} of {} events", submitted, published);
    Ok(())
}

async fn unprocessed(state: &AppState, limit: u64, json: bool) -> Result<()> {
    let rows = state
        .pipeline
        .list_unprocessed(limit)
        .await
        .context("failed to list unprocessed events")?;

    if json {
        let rendered: Vec<_> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.id,
                    "type": row.event_type,
                    "created_at": row.created_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    } else if rows.is_empty() {
        println!("No unprocessed events");
    } else {
        for row in rows {
            println!("{}  {}  {}", row.created_at, row.id, row.event_type);
        }
    }
    Ok(())
}
