//! Librarium import CLI
//!
//! Imports a local CSV file synchronously:
//! 1. Creates an import job for the file
//! 2. Runs the orchestrator in-process
//! 3. Prints the final job record as JSON

use anyhow::Context;
use clap::Parser;
use librarium_common::db::models::JobStatus;
use librarium_common::{config::AppConfig, db, DbPool, ImportJobMessage, Repository, VERSION};
use librarium_importer::{ImportOrchestrator, RunOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "librarium-import", version, about = "Import a catalog CSV file")]
struct Cli {
    /// CSV file to import
    path: PathBuf,

    /// Rows per transaction
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Configuration file (defaults to config/ and APP__ variables)
    #[arg(short, long)]
    config: Option<String>,

    /// Database URL, overrides configuration
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => AppConfig::from_file(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.import.chunk_size = chunk_size;
    }

    // Logs go to stderr so stdout carries only the job record
    let filter = EnvFilter::try_new(&config.observability.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Librarium import v{}", VERSION);

    anyhow::ensure!(cli.path.is_file(), "No such file: {}", cli.path.display());
    let filename = cli
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.path.display().to_string());

    let pool = DbPool::new(&config.database).await?;
    if config.database.auto_migrate {
        db::ensure_schema(pool.write()).await?;
    }
    let repository = Repository::new(pool);

    let job = repository.create_import_job(&filename).await?;
    info!(job_id = %job.id, path = %cli.path.display(), "Import job created");

    let orchestrator = ImportOrchestrator::new(repository.clone()).with_chunk_size(config.import.chunk_size);
    let message = ImportJobMessage::new(job.id, &cli.path, filename).keep_file();

    let outcome = orchestrator.run(&message).await?;
    if outcome == RunOutcome::Skipped {
        anyhow::bail!("Import job {} was not claimable", job.id);
    }

    let job = repository
        .find_import_job(job.id)
        .await?
        .context("Import job disappeared")?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    Ok(if job.job_status() == JobStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
