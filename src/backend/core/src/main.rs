//! Auto-Apply Server - Main entry point
//!
//! Runs the dispatch scheduler, or a single maintenance operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use autoapply_core::{
    collaborators::{
        Collaborators, HttpSimilarityModel, InMemoryCollaborators, LogNotifier, PlatformClient,
        SimilarityModel,
    },
    config::Config,
    jobs::Pipeline,
    models::{CandidateProfile, JobPosting},
    scoring::FitIndexScorer,
    store::{PgStore, Stores},
    telemetry,
};

#[derive(Parser)]
#[command(
    name = "autoapply-server",
    version,
    about = "Auto-apply pipeline: quota-paced dispatch, submission and credit ledger",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path (environment variables still override it)
    #[arg(short, long, global = true, env = "AUTOAPPLY_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until SIGINT/SIGTERM (default)
    Serve,
    /// Run one reclaim and dispatch cycle and wait for its work
    DispatchOnce,
    /// Purge terminal jobs older than the retention period
    Sweep,
    /// Score a candidate against a posting and print the result as JSON
    Score {
        /// Candidate profile JSON file
        #[arg(long)]
        candidate: PathBuf,
        /// Job posting JSON file
        #[arg(long)]
        job: PathBuf,
        /// Semantic similarity in 0..=1
        #[arg(long)]
        similarity: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Some(Commands::Score {
        candidate,
        job,
        similarity,
    }) = &cli.command
    {
        return score(candidate, job, *similarity);
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Auto-Apply Server"
    );

    let stores = build_stores(&config).await?;
    let collaborators = build_collaborators(&config)?;
    let pipeline = Pipeline::new(config, stores, collaborators);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let handle = pipeline.start();
            shutdown_signal().await;
            handle.stop().await;
            tracing::info!(
                processed = pipeline.pool.stats().processed(),
                "Server shutdown complete"
            );
        }
        Commands::DispatchOnce => {
            let summary = pipeline.scheduler().run_once(Utc::now()).await?;
            tracing::info!(
                reclaimed = summary.reclaimed,
                inspected = summary.dispatch.inspected,
                claimed = summary.outcomes.len() + summary.errors,
                applied = summary.count("applied"),
                retrying = summary.count("retrying"),
                failed = summary.count("failed"),
                discarded = summary.count("discarded"),
                "Dispatch cycle finished"
            );
        }
        Commands::Sweep => {
            let purged = pipeline.scheduler().sweep(Utc::now()).await?;
            tracing::info!(purged, "Retention sweep finished");
        }
        Commands::Score { .. } => {}
    }

    Ok(())
}

fn score(candidate: &Path, job: &Path, similarity: Option<f64>) -> anyhow::Result<()> {
    let candidate: CandidateProfile = read_json(candidate)?;
    let job: JobPosting = read_json(job)?;

    let result = FitIndexScorer::new().score(&candidate, &job, similarity);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    let Some(database) = &config.database else {
        tracing::warn!("No database configured, using the in-memory store");
        return Ok(Stores::memory());
    };

    let store = PgStore::connect(database).await?;
    if database.run_migrations {
        store.migrate().await?;
        tracing::info!("Database migrations applied");
    }
    tracing::info!("Connected to database");
    Ok(Stores::from_shared(Arc::new(store)))
}

fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let similarity = HttpSimilarityModel::from_config(&config.collaborators)?;

    match PlatformClient::from_config(&config.collaborators)? {
        Some(client) => {
            tracing::info!(platform_url = %client.base_url(), "Using platform API collaborators");
            Ok(Collaborators::platform(client, similarity))
        }
        None => {
            tracing::warn!("No platform URL configured, using in-process collaborators");
            let mut collaborators = InMemoryCollaborators::new()
                .collaborators()
                .with_notifier(Arc::new(LogNotifier));
            if let Some(model) = similarity {
                collaborators.similarity = Some(Arc::new(model) as Arc<dyn SimilarityModel>);
            }
            Ok(collaborators)
        }
    }
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
