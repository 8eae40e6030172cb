//! Scheduled MySQL/PostgreSQL backup
//!
//! Dumps every database of the configured servers, archives the dumps and
//! uploads the archive to S3-compatible object storage.

// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use backup::EngineReport;
use config::AppConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup job
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    finish(run_app().await)
}

/// Logs the outcome of a run and maps it to the process exit code.
fn finish(outcome: Result<Vec<EngineReport>>) -> ExitCode {
    match outcome {
        Ok(reports) => {
            print_summary(&reports);
            info!("✅ Backup completed.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<Vec<EngineReport>> {
    // Optional first argument: dotenv file to load instead of ./.env
    let env_file = env::args().nth(1).map(PathBuf::from);
    match config::load_env_file(env_file.as_deref()).context("Failed to load environment file")? {
        Some(path) => info!("Loaded environment from {}", path.display()),
        None => info!("No .env file found, using the process environment"),
    }

    let app_config = AppConfig::from_env().context("Failed to load backup configuration")?;
    info!("🛠 Using backup root: {}", app_config.backup_dir.display());
    if !app_config.discard.is_empty() {
        info!("{} databases are in the discard list", app_config.discard.len());
    }

    let reports = backup::run_backup_flow(&app_config)
        .await
        .context("Backup process failed")?;
    Ok(reports)
}

fn print_summary(reports: &[EngineReport]) {
    for report in reports {
        if report.archive_retained() {
            warn!(
                "{}: {} databases dumped, upload failed; archive kept at {}",
                report.engine,
                report.dumped.len(),
                report.archive.display()
            );
        } else {
            info!(
                "{}: {} databases dumped, {} skipped, uploaded as {} ({})",
                report.engine,
                report.dumped.len(),
                report.skipped.len(),
                report.remote_key,
                report.stage
            );
        }
    }
}
