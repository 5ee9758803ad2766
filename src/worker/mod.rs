//! Job intake: a durable queue of runs and the worker that drains it.
//!
//! Each claimed job is one call to [`PipelineEngine::execute`]; up to
//! `concurrency` runs proceed at the same time, one task per run.

pub mod queue;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::core::{EventPublisher, PipelineEngine};
use crate::domain::{TOPIC_PIPELINE_COMPLETED, TOPIC_PIPELINE_FAILED};

pub use queue::{EnqueueResult, FailOutcome, Job, JobQueue, JobQueueError, JobStatus, QueueStatus};

/// What one delivery of a job ended in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { id: String },
    Requeued { id: String, attempt: u32 },
    Failed { id: String, attempts: u32 },
}

impl JobOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Completed { id } | Self::Requeued { id, .. } | Self::Failed { id, .. } => id,
        }
    }
}

/// Counters reported when [`Worker::run`] returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Requeued { .. } => self.requeued += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Pulls jobs from a [`JobQueue`] and drives them through the engine
#[derive(Clone)]
pub struct Worker {
    engine: Arc<PipelineEngine>,
    queue: JobQueue,
    events: Arc<dyn EventPublisher>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(engine: Arc<PipelineEngine>, queue: JobQueue, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            engine,
            queue,
            events,
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Claim and process a single ready job, if there is one
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobQueueError> {
        match self.queue.claim_next().await? {
            Some(job) => Ok(Some(self.process(job).await)),
            None => Ok(None),
        }
    }

    /// Process jobs until `shutdown` resolves, then wait for in-flight runs
    pub async fn run<S>(&self, shutdown: S) -> WorkerStats
    where
        S: Future<Output = ()>,
    {
        let mut stats = WorkerStats::default();
        let mut in_flight: JoinSet<JobOutcome> = JoinSet::new();
        tokio::pin!(shutdown);

        info!(concurrency = self.concurrency, queue = %self.queue.path().display(), "Worker started");

        loop {
            while in_flight.len() < self.concurrency {
                match self.queue.claim_next().await {
                    Ok(Some(job)) => {
                        let worker = self.clone();
                        in_flight.spawn(async move { worker.process(job).await });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to claim job");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!(in_flight = in_flight.len(), "Shutdown requested, finishing in-flight jobs");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    record_joined(&mut stats, joined);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            record_joined(&mut stats, joined);
        }

        info!(
            completed = stats.completed,
            requeued = stats.requeued,
            failed = stats.failed,
            "Worker stopped"
        );
        stats
    }

    async fn process(&self, job: Job) -> JobOutcome {
        let id = job.id.clone();
        info!(pipeline_id = %id, attempt = job.attempts, "Processing job");

        let heartbeat = self.spawn_heartbeat(id.clone());
        let result = self.engine.execute(&job.context).await;
        heartbeat.abort();

        let error = match result {
            Ok(run) => {
                if let Err(e) = self.queue.complete(&id).await {
                    error!(pipeline_id = %id, error = %e, "Failed to mark job done");
                }

                self.notify(
                    TOPIC_PIPELINE_COMPLETED,
                    json!({
                        "pipelineId": id,
                        "videoId": run.outputs.upload.video_id,
                        "url": run.outputs.upload.url,
                        "attempt": job.attempts,
                        "completedAt": Utc::now(),
                    }),
                )
                .await;

                info!(pipeline_id = %id, "Job completed");
                return JobOutcome::Completed { id };
            }
            Err(e) => e,
        };

        let message = error.to_string();
        let outcome = match self.queue.fail(&id, &message).await {
            Ok(FailOutcome::Requeued { attempt, available_at }) => {
                warn!(pipeline_id = %id, attempt, %available_at, error = %message, "Job failed, requeued");
                JobOutcome::Requeued { id: id.clone(), attempt }
            }
            Ok(FailOutcome::Failed { attempts }) => {
                error!(pipeline_id = %id, attempts, error = %message, "Job failed, out of attempts");
                JobOutcome::Failed { id: id.clone(), attempts }
            }
            Err(e) => {
                error!(pipeline_id = %id, error = %e, "Failed to record job failure");
                JobOutcome::Failed {
                    id: id.clone(),
                    attempts: job.attempts,
                }
            }
        };

        self.notify(
            TOPIC_PIPELINE_FAILED,
            json!({
                "pipelineId": id,
                "stage": error.failed_stage().map(|s| s.as_str()),
                "error": message,
                "attempt": job.attempts,
                "willRetry": matches!(outcome, JobOutcome::Requeued { .. }),
                "failedAt": Utc::now(),
            }),
        )
        .await;

        outcome
    }

    /// Keep renewing the claim on `id` until aborted
    fn spawn_heartbeat(&self, id: String) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let period = (queue.lease() / 3).max(Duration::from_millis(5));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = queue.renew(&id).await {
                    warn!(pipeline_id = %id, error = %e, "Failed to renew job lease");
                }
            }
        })
    }

    async fn notify(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.events.publish(topic, payload).await {
            warn!(topic, error = %e, "Failed to publish event");
        }
    }
}

fn record_joined(stats: &mut WorkerStats, joined: Result<JobOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => stats.record(&outcome),
        Err(e) => error!(error = %e, "Job task panicked"),
    }
}
