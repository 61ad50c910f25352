//! Backup Archiver - Main entry point
//!
//! Runs one archiving pass over every configured backup group and exits.

use anyhow::{Context, Result};
use backup_archiver::{config::Config, daemon::ShutdownCoordinator, job, remote::BucketStore, utils};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting backup-archiver v{} (archive root: {}, {} groups)",
        env!("CARGO_PKG_VERSION"),
        config.archive.root.display(),
        config.groups.len()
    );

    let store = BucketStore::from_config(&config.remote.backend)
        .context("Failed to open the remote store")?;

    // Stop between backups on SIGINT/SIGTERM
    let coordinator = ShutdownCoordinator::new();
    let cancel = coordinator.token();
    let signals = tokio::spawn(async move {
        coordinator.wait_for_signal().await;
    });

    let report = job::run(&config, &store, &cancel).await;
    signals.abort();

    for group in &report.groups {
        tracing::info!(
            prefix = %group.prefix,
            archived = group.archived.len(),
            failed = group.failed.len(),
            deleted_archives = group.retention.as_ref().map(|r| r.deleted().len()).unwrap_or(0),
            pruned_objects = group.cleanup.as_ref().map(|c| c.deleted).unwrap_or(0),
            "Group summary"
        );
        if let Some(reason) = &group.aborted {
            tracing::warn!(prefix = %group.prefix, "Group stopped early: {}", reason);
        }
    }

    if report.has_failures() {
        anyhow::bail!("Some backups could not be archived, see the log above");
    }

    Ok(())
}
