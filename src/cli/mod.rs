//! Command-line interface for faceless.
//!
//! Provides commands for running pipelines inline, queueing them for a
//! worker, checking status, listing runs and resuming failed runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;

use crate::config::{self, ResolvedConfig};
use crate::core::{
    ArtifactStore, CompletedRun, EventBus, EventHandler, EventPublisher, MemoryBroker,
    PipelineEngine, PipelineError, RerunPolicy, RetryExecutor, StateStore,
};
use crate::domain::{PipelineContext, PipelineState, StageName, VideoFormat, TOPIC_PIPELINE_QUEUED};
use crate::stages::StageRegistry;
use crate::worker::{JobQueue, Worker};

/// faceless - Durable orchestrator for faceless video pipelines
#[derive(Parser, Debug)]
#[command(name = "faceless")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline inline
    Run {
        /// Subject of the video
        #[arg(short, long)]
        topic: String,

        /// Video format (short or long)
        #[arg(short, long, default_value = "short")]
        format: VideoFormat,

        /// Use this pipeline id instead of generating one (must be unused;
        /// stored runs are continued with `resume`)
        #[arg(long)]
        id: Option<String>,

        /// Print lifecycle events as they are published
        #[arg(long)]
        follow: bool,
    },

    /// Queue a pipeline for a worker
    Enqueue {
        /// Subject of the video
        #[arg(short, long)]
        topic: String,

        /// Video format (short or long)
        #[arg(short, long, default_value = "short")]
        format: VideoFormat,
    },

    /// Process queued pipelines
    Worker {
        /// Runs processed at the same time (defaults to queue.concurrency)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Process at most one ready job and exit
        #[arg(long)]
        once: bool,
    },

    /// Show the persisted state of a pipeline
    Status {
        /// Pipeline ID
        pipeline_id: String,
    },

    /// List recent pipelines
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Re-run a stored pipeline, skipping stages that already completed
    Resume {
        /// Pipeline ID to resume
        pipeline_id: String,
    },

    /// Show the job queue
    Jobs,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::config()?;

        match self.command {
            Commands::Run {
                topic,
                format,
                id,
                follow,
            } => run_pipeline(config, topic, format, id, follow).await,
            Commands::Enqueue { topic, format } => enqueue(config, topic, format).await,
            Commands::Worker { concurrency, once } => run_worker(config, concurrency, once).await,
            Commands::Status { pipeline_id } => show_status(config, &pipeline_id).await,
            Commands::Runs { limit } => list_runs(config, limit).await,
            Commands::Resume { pipeline_id } => resume_pipeline(config, &pipeline_id).await,
            Commands::Jobs => show_jobs(config).await,
            Commands::Config => show_config(config).await,
        }
    }
}

/// Everything a command needs, built once from the resolved configuration
struct Runtime {
    config: ResolvedConfig,
    store: StateStore,
    artifacts: ArtifactStore,
    bus: Arc<EventBus>,
}

impl Runtime {
    async fn open(config: &ResolvedConfig) -> Result<Self> {
        let store = StateStore::open(&config.data_dir)
            .await
            .context("Failed to open state store")?;
        let artifacts = ArtifactStore::open(&config.data_dir).await?;

        let broker = if config.events.journal {
            MemoryBroker::with_journal(config.events_dir())
        } else {
            MemoryBroker::new()
        };
        let bus = Arc::new(EventBus::new(Arc::new(broker), config.events.exchange.clone()));
        bus.connect().await.context("Failed to connect event bus")?;

        Ok(Self {
            config: config.clone(),
            store,
            artifacts,
            bus,
        })
    }

    fn engine(&self, rerun: RerunPolicy) -> Result<PipelineEngine> {
        let stages = StageRegistry::from_settings(&self.config.stages)?;
        let events: Arc<dyn EventPublisher> = self.bus.clone();

        Ok(
            PipelineEngine::new(self.store.clone(), self.artifacts.clone(), stages, events)
                .with_retry(RetryExecutor::new(self.config.retry.clone()))
                .with_rerun_policy(rerun)
                .with_stage_settings(self.config.stages.clone()),
        )
    }

    async fn queue(&self) -> Result<JobQueue> {
        JobQueue::open(self.config.queue_path(), &self.config.queue)
            .await
            .context("Failed to open job queue")
    }

    async fn close(&self) {
        self.bus.disconnect().await;
    }
}

/// Prints every event it receives on stderr
struct FollowHandler;

#[async_trait]
impl EventHandler for FollowHandler {
    async fn handle(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let detail = payload
            .get("error")
            .and_then(|e| e.as_str())
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        eprintln!("[event] {}{}", topic, detail);
        Ok(())
    }
}

/// Run a pipeline inline
async fn run_pipeline(
    config: &ResolvedConfig,
    topic: String,
    format: VideoFormat,
    id: Option<String>,
    follow: bool,
) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let context = new_context(&runtime.store, topic, format, id).await?;

    let _follow = if follow {
        Some(runtime.bus.subscribe("pipeline.#", Arc::new(FollowHandler)).await?)
    } else {
        None
    };

    eprintln!("Pipeline {} started", context.id);
    let engine = runtime.engine(RerunPolicy::Restart)?;
    let result = engine.execute(&context).await;

    // Let the follower drain what was published before closing
    tokio::task::yield_now().await;
    runtime.close().await;

    report_run(&context.id, result)
}

/// Build the context of a new run. A caller-chosen id must not belong to a
/// stored run: its context is immutable.
async fn new_context(
    store: &StateStore,
    topic: String,
    format: VideoFormat,
    id: Option<String>,
) -> Result<PipelineContext> {
    let Some(id) = id else {
        return PipelineContext::new(topic, format).map_err(anyhow::Error::msg);
    };

    if store.load(&id).await?.is_some() {
        anyhow::bail!(
            "Pipeline {} already exists; use `faceless resume {}` to continue it",
            id,
            id
        );
    }

    PipelineContext::with_id(id, topic, format, chrono::Utc::now()).map_err(anyhow::Error::msg)
}

/// Re-run a stored pipeline, reusing completed stages
async fn resume_pipeline(config: &ResolvedConfig, pipeline_id: &str) -> Result<()> {
    let runtime = Runtime::open(config).await?;

    let state = runtime
        .store
        .load(pipeline_id)
        .await?
        .with_context(|| format!("No state found for pipeline {}", pipeline_id))?;

    eprintln!("Resuming pipeline {} ({})", pipeline_id, state.summary());
    let engine = runtime.engine(RerunPolicy::Resume)?;
    let result = engine.execute(&state.context).await;
    runtime.close().await;

    report_run(pipeline_id, result)
}

fn report_run(pipeline_id: &str, result: Result<CompletedRun, PipelineError>) -> Result<()> {
    match result {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run.outputs)?);
            eprintln!("\n[Pipeline {} completed successfully]", pipeline_id);
            Ok(())
        }
        Err(e) => {
            eprintln!("\n[Pipeline {} failed: {}]", pipeline_id, e);
            Err(e.into())
        }
    }
}

/// Queue a pipeline for a worker
async fn enqueue(config: &ResolvedConfig, topic: String, format: VideoFormat) -> Result<()> {
    let context = PipelineContext::new(topic, format).map_err(anyhow::Error::msg)?;
    let runtime = Runtime::open(config).await?;
    let queue = runtime.queue().await?;

    let result = queue.enqueue(&context).await?;
    if result.is_new() {
        let payload = serde_json::json!({
            "pipelineId": context.id,
            "topic": context.topic,
            "format": context.format,
            "createdAt": context.created_at,
        });
        if let Err(e) = runtime.bus.publish(TOPIC_PIPELINE_QUEUED, payload).await {
            tracing::warn!(error = %e, "Failed to publish queued event");
        }
    }
    runtime.close().await;

    println!("{}", result.id());
    Ok(())
}

/// Process queued pipelines until Ctrl-C (or one job with --once)
async fn run_worker(config: &ResolvedConfig, concurrency: Option<usize>, once: bool) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let engine = Arc::new(runtime.engine(RerunPolicy::Restart)?);
    let events: Arc<dyn EventPublisher> = runtime.bus.clone();

    let worker = Worker::new(engine, runtime.queue().await?, events)
        .with_concurrency(concurrency.unwrap_or(config.queue.concurrency))
        .with_poll_interval(config.queue.poll_interval());

    if once {
        match worker.run_once().await? {
            Some(outcome) => println!("{:?}", outcome),
            None => println!("No ready jobs"),
        }
    } else {
        let stats = worker
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
            })
            .await;
        println!(
            "Completed: {}  Requeued: {}  Failed: {}",
            stats.completed, stats.requeued, stats.failed
        );
    }

    runtime.close().await;
    Ok(())
}

/// Show the persisted state of a pipeline
async fn show_status(config: &ResolvedConfig, pipeline_id: &str) -> Result<()> {
    let store = StateStore::open(&config.data_dir).await?;
    let state = store
        .load(pipeline_id)
        .await?
        .with_context(|| format!("No state found for pipeline {}", pipeline_id))?;

    print_state(&state);
    Ok(())
}

fn print_state(state: &PipelineState) {
    println!("Pipeline ID: {}", state.context.id);
    println!("Topic: {}", state.context.topic);
    println!("Format: {}", state.context.format);
    println!("Created: {}", state.context.created_at);
    println!("State: {}", state.summary());
    println!("\nStages:");

    for stage in StageName::ALL {
        match state.stage(stage) {
            Some(status) => {
                let mut line = format!("  {:<16} {}", stage.as_str(), status.status);
                if let Some(retries) = status.retry_count.filter(|r| *r > 0) {
                    line.push_str(&format!(" (retries: {})", retries));
                }
                if let Some(ref error) = status.error {
                    line.push_str(&format!(" - {}", error));
                }
                println!("{}", line);
            }
            None => println!("  {:<16} -", stage.as_str()),
        }
    }
}

/// List recent pipelines
async fn list_runs(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let store = StateStore::open(&config.data_dir).await?;
    let mut states = store.collect_all().await;
    states.truncate(limit);

    if states.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<44} {:<10} {:<12} {:<20}", "PIPELINE ID", "FORMAT", "STATE", "CREATED");
    println!("{}", "-".repeat(88));

    for state in states {
        println!(
            "{:<44} {:<10} {:<12} {:<20}",
            state.context.id,
            state.context.format.as_str(),
            state.summary().to_string(),
            state.context.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show the job queue
async fn show_jobs(config: &ResolvedConfig) -> Result<()> {
    let queue = JobQueue::with_config(config.queue_path(), &config.queue);
    let status = queue.status().await?;

    println!("Queue: {}", queue.path().display());
    println!(
        "Pending: {}  Running: {}  Done: {}  Failed: {}  (total {})",
        status.pending,
        status.running,
        status.done,
        status.failed,
        status.total()
    );

    if !status.recent.is_empty() {
        println!("\nRecent:");
        for job in &status.recent {
            let error = job.error.as_deref().map(|e| format!(" - {}", e)).unwrap_or_default();
            println!(
                "  {:<44} {:<8} attempts: {}{}",
                job.id,
                job.status.to_string(),
                job.attempts,
                error
            );
        }
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config(config: &ResolvedConfig) -> Result<()> {
    match &config.config_file {
        Some(path) => println!("# Config file: {}", path.display()),
        None => println!("# No config file found (using defaults)"),
    }
    print!("{}", serde_yaml::to_string(config)?);

    let store = StateStore::open(&config.data_dir).await?;
    let stored = store.list_all().count().await;
    println!("# Stored runs: {}", stored);

    Ok(())
}
