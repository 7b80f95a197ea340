//! Metadata log inspection tool

use clap::{Parser, Subcommand};
use schemashift::alter::codec;
use schemashift::common::{format_millis, Config};
use schemashift::journal::{FileEditLog, JournalEntry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "schemashift-inspect")]
#[command(about = "Inspect schemashift metadata logs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record of the log
    Dump {
        /// Log file (defaults to journal.path from the config)
        #[arg(long)]
        log: Option<PathBuf>,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Print the last known state of every job in the log
    Status {
        /// Log file (defaults to journal.path from the config)
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct RecordSummary {
    sequence: u64,
    op: String,
    meta_version: u32,
    db_id: i64,
    table_id: i64,
    table_name: String,
    state: String,
    transaction_id: i64,
    create_time: String,
    finished_time: String,
    changed_indices: Vec<i64>,
    cancel_msg: String,
}

fn summarize(entry: &JournalEntry) -> anyhow::Result<RecordSummary> {
    let job = codec::decode(&entry.payload, entry.meta_version)?;
    Ok(RecordSummary {
        sequence: entry.sequence,
        op: entry.op.to_string(),
        meta_version: entry.meta_version,
        db_id: job.db_id(),
        table_id: job.table_id(),
        table_name: job.table_name().to_string(),
        state: job.state().to_string(),
        transaction_id: job.transaction_id(),
        create_time: format_millis(job.create_time()),
        finished_time: format_millis(job.finished_time()),
        changed_indices: job.changed_index_ids(),
        cancel_msg: job.cancel_msg(),
    })
}

fn resolve_log(log: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match log {
        Some(path) => Ok(path),
        None => Ok(Config::load()?.journal.path),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { log, json } => {
            let path = resolve_log(log)?;
            let entries = FileEditLog::read_all(&path)?;
            tracing::info!("{} records in {}", entries.len(), path.display());

            for entry in &entries {
                let summary = summarize(entry)?;
                if json {
                    println!("{}", serde_json::to_string(&summary)?);
                } else {
                    println!(
                        "#{} {} table={}({}) state={} txn={} indices={:?}",
                        summary.sequence,
                        summary.op,
                        summary.table_name,
                        summary.table_id,
                        summary.state,
                        summary.transaction_id,
                        summary.changed_indices
                    );
                    if !summary.cancel_msg.is_empty() {
                        println!("    cancelled: {}", summary.cancel_msg);
                    }
                }
            }
        }

        Commands::Status { log } => {
            let path = resolve_log(log)?;
            let mut latest: BTreeMap<i64, RecordSummary> = BTreeMap::new();
            FileEditLog::replay(&path, |entry| {
                match summarize(&entry) {
                    Ok(summary) => {
                        latest.insert(summary.table_id, summary);
                    }
                    Err(e) => tracing::warn!("skipping record {}: {}", entry.sequence, e),
                }
                Ok(())
            })?;

            println!("{}", serde_json::to_string_pretty(&latest)?);
        }
    }

    Ok(())
}
