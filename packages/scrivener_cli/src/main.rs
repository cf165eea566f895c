//! Scrivener command line.
//!
//! Replays a recorded batch of edit operations through the coordinator and
//! prints what each submitter would have received.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use scrivener::model::EditOperation;
use scrivener::{ConsolidationCoordinator, ConsolidationOutcome, CoordinatorConfig};

#[derive(Parser, Debug)]
#[command(name = "scrivener")]
#[command(about = "Coordinate concurrent edit batches against shared documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit every operation in a JSON file concurrently and print the outcomes
    Replay {
        /// JSON array of edit operations
        #[arg(value_name = "OPS")]
        operations: PathBuf,

        /// Configuration file overriding the defaults
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Also print the published event stream
        #[arg(short, long)]
        events: bool,
    },
    /// Print the default configuration
    DefaultConfig,
}

#[derive(Serialize)]
struct Report<'a> {
    operation_id: Uuid,
    source_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a ConsolidationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Replay {
            operations,
            config,
            events,
        } => replay(operations, config, events).await,
        Command::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&CoordinatorConfig::default())?);
            Ok(())
        }
    }
}

async fn replay(operations: PathBuf, config: Option<PathBuf>, show_events: bool) -> Result<()> {
    let config = match config {
        Some(path) => CoordinatorConfig::from_json_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };

    let text = std::fs::read_to_string(&operations)
        .with_context(|| format!("reading {}", operations.display()))?;
    let batch: Vec<EditOperation> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", operations.display()))?;
    log::info!("Replaying {} operations from {}", batch.len(), operations.display());

    let coordinator = ConsolidationCoordinator::new(config);
    coordinator.start();
    let mut event_rx = coordinator.subscribe();

    let handles: Vec<_> = batch
        .iter()
        .cloned()
        .map(|op| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.submit(op).await })
        })
        .collect();

    for (op, handle) in batch.iter().zip(handles) {
        let result = handle.await.context("submission task panicked")?;
        let report = match &result {
            Ok(outcome) => Report {
                operation_id: op.id,
                source_id: &op.source_id,
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => Report {
                operation_id: op.id,
                source_id: &op.source_id,
                outcome: None,
                error: Some(e.to_string()),
            },
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if show_events {
        while let Ok(event) = event_rx.try_recv() {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    coordinator.shutdown();
    Ok(())
}
