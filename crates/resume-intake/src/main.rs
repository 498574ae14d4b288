//! resume-intake: mailbox resume ingestion daemon and run queue CLI.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use resume_intake::config::Config;
use resume_intake::coordinator::{cancel_run, enqueue_run, EnqueueRequest, RunCoordinator};
use resume_intake::db::{item_repo, run_repo, Database};
use resume_intake::enrichment::{EnrichmentQueue, EnrichmentWorker, HttpEnricher};
use resume_intake::error::{ConfigError, Result};
use resume_intake::extract::DocumentExtractor;
use resume_intake::pipeline::{log_events, BroadcastProgress, ItemPipeline, ProgressReporter};
use resume_intake::provider::{EligibilityFilter, EmailProvider, GraphMailProvider};
use resume_intake::search::{SearchMode, SearchOrchestrator};
use resume_intake::storage::FileObjectStorage;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "resume-intake")]
#[command(about = "Ingest resumes from a mailbox into storage and the enrichment queue")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, env = "RESUME_INTAKE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator loop and the enrichment worker until Ctrl-C
    Daemon,
    /// Queue a run for a mailbox and job
    Enqueue {
        mailbox: String,
        job_id: String,
        /// Search text; without it the run deep-scans
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value = "graph_search")]
        mode: SearchMode,
        #[arg(long)]
        lookback_days: Option<u32>,
    },
    /// Cancel an enqueued or running run
    Cancel { run_id: String },
    /// Show run counts, or one run's item summary
    Status { run_id: Option<String> },
}

fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn load(cli: &Cli) -> Result<(Config, Database)> {
    let path = cli.config.clone().ok_or_else(|| ConfigError::Validation {
        message: "no config file given (use --config or RESUME_INTAKE_CONFIG)".to_string(),
    })?;
    let config = resume_intake::load_config(&path)?;
    let db_path = config
        .resolved_database_path()
        .ok_or_else(|| ConfigError::Validation {
            message: "database_path is not set and no home directory was found".to_string(),
        })?;
    let db = Database::open(&db_path)?;
    Ok((config, db))
}

async fn daemon(config: Config, db: Database) -> Result<()> {
    let graph = config
        .provider
        .graph
        .as_ref()
        .ok_or_else(|| ConfigError::Validation {
            message: "provider.graph is required to run the daemon".to_string(),
        })?;
    let provider: Arc<dyn EmailProvider> = Arc::new(GraphMailProvider::from_config(graph)?);
    let broadcast = BroadcastProgress::new(PROGRESS_CHANNEL_CAPACITY);
    tokio::spawn(log_events(broadcast.subscribe()));
    let progress: Arc<dyn ProgressReporter> = Arc::new(broadcast);
    let (queue, wake) = EnrichmentQueue::with_wake(db.clone(), config.enrichment.batch_size as usize);

    let pipeline = ItemPipeline::new(
        db.clone(),
        Arc::clone(&provider),
        Arc::new(FileObjectStorage::new(&config.storage.root)),
        Arc::new(DocumentExtractor::new()),
        queue.clone(),
        EligibilityFilter::from_config(&config.eligibility),
        config.pipeline.clone(),
        Arc::clone(&progress),
    );
    let search = SearchOrchestrator::new(Arc::clone(&provider), config.search.clone())
        .with_max_pages(graph.max_pages);
    let coordinator = RunCoordinator::new(
        db.clone(),
        search,
        pipeline,
        config.coordinator.clone(),
        progress,
    );

    let recovered = coordinator.recover_interrupted()?;
    let released =
        queue.release_stale(Duration::from_secs(config.enrichment.stale_after_secs))?;
    tracing::info!(recovered, released, "Recovered interrupted work");

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("Shutdown requested");
        flag.store(true, Ordering::Relaxed);
    }) {
        tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let worker = match config.enrichment.endpoint.as_deref() {
        Some(endpoint) => Some(EnrichmentWorker::new(
            &queue,
            Arc::new(HttpEnricher::new(endpoint)?),
            config.enrichment.clone(),
        )),
        None => {
            tracing::warn!("enrichment.endpoint is not set; enrichment jobs will stay pending");
            None
        }
    };

    let worker_loop = async {
        if let Some(worker) = &worker {
            worker.run(Some(wake), Arc::clone(&shutdown)).await;
        }
    };
    tokio::join!(coordinator.run_loop(Arc::clone(&shutdown)), worker_loop);
    Ok(())
}

fn status(db: &Database, run_id: Option<&str>) -> Result<()> {
    match run_id {
        Some(run_id) => {
            let run = run_repo::find_by_id(db, run_id)?.ok_or_else(|| {
                resume_intake::CoordinatorError::NotFound(run_id.to_string())
            })?;
            let summary = item_repo::summary_for_run(db, run_id)?;
            println!(
                "{} {} processed {}/{} last_error={}",
                run.id,
                run.status,
                run.processed_messages,
                run.total_messages,
                run.last_error.as_deref().unwrap_or("-")
            );
            println!(
                "items: total={} pending={} completed={} failed={} poisoned={} with_resume={}",
                summary.total,
                summary.pending,
                summary.completed,
                summary.failed,
                summary.poisoned,
                summary.with_resume
            );
        }
        None => {
            for (status, count) in run_repo::counts_by_status(db)? {
                println!("{status}: {count}");
            }
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let (config, db) = load(&cli)?;
    match cli.command {
        Command::Daemon => daemon(config, db).await,
        Command::Enqueue {
            mailbox,
            job_id,
            query,
            mode,
            lookback_days,
        } => {
            let run = enqueue_run(
                &db,
                EnqueueRequest {
                    mailbox,
                    job_id,
                    query,
                    mode,
                    lookback_days,
                },
                config.search.lookback_days,
            )?;
            println!("{}", run.id);
            Ok(())
        }
        Command::Cancel { run_id } => {
            if !cancel_run(&db, &run_id)? {
                println!("run {run_id} is already finished");
            }
            Ok(())
        }
        Command::Status { run_id } => status(&db, run_id.as_deref()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
