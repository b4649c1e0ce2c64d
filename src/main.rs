//! DAG Writer
//!
//! Feeds validated units into the ledger stores.
//!
//! ## Usage
//!
//! ```bash
//! # Commit every record of a JSON-lines file
//! dag-writer import units.jsonl
//!
//! # Custom storage directory, light node
//! dag-writer --storage-dir /data/ledger --light import units.jsonl
//!
//! # Print table and cache counts
//! dag-writer stats
//! ```
//!
//! Each import line is `{"joint": {...}, "validation_state": {...}}`.
//! A fatal error stops the import and exits non-zero.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dag_writer::{spawn_logging_listener, Collaborators, Config, Joint, ValidationState, Writer};
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dag-writer")]
#[command(about = "Commit path for a DAG ledger")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "DAG_WRITER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "DAG_WRITER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Run as a light node
    #[arg(long)]
    light: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Commit validated joints from a JSON-lines file
    Import {
        file: PathBuf,
    },
    /// Print store statistics
    Stats,
}

#[derive(Deserialize)]
struct ImportRecord {
    joint: Joint,
    validation_state: ValidationState,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dag_writer=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if args.light {
        config.light = true;
    }

    info!(storage_dir = %config.storage_dir.display(), light = config.light, "Starting dag-writer");

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let writer = Writer::open(config, Collaborators::detached())?;

    match args.command {
        Command::Import { file } => import(&writer, file).await,
        Command::Stats => {
            let stats = writer.db().stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!(
                "joints: {}, cached unstable: {}, cached stable: {}",
                writer.joints().joint_count(),
                writer.cache().unstable_count(),
                writer.cache().stable_count()
            );
            Ok(())
        }
    }
}

async fn import(writer: &Writer, file: PathBuf) -> anyhow::Result<()> {
    let listener = spawn_logging_listener(writer.events().clone());
    let reader = std::io::BufReader::new(
        std::fs::File::open(&file).with_context(|| format!("opening {}", file.display()))?,
    );

    let mut committed = 0u64;
    let mut failed = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ImportRecord = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid record", line_no + 1))?;
        let unit = record.joint.unit.unit.clone();

        match writer.save_joint(record.joint, record.validation_state).await {
            Ok(report) => {
                committed += 1;
                if !report.nonfatal_errors.is_empty() {
                    info!(unit = %unit, mismatches = report.nonfatal_errors.len(), "Committed with reported mismatches");
                }
            }
            Err(e) if e.is_fatal() => {
                error!(unit = %unit, error = %e, line = line_no + 1, "Fatal error, stopping import");
                return Err(e.into());
            }
            Err(e) => {
                failed += 1;
                error!(unit = %unit, error = %e, "Failed to commit unit");
            }
        }
    }

    info!(committed, failed, "Import finished");
    listener.abort();
    if failed > 0 {
        anyhow::bail!("{} units failed to commit", failed);
    }
    Ok(())
}
