//! JSONL-based job queue for pipeline runs.
//!
//! Append-only JSONL with state derived from replay. Every state change of a
//! job is appended as a new line; a job's id is its pipeline id. Each
//! read-modify-append holds an exclusive `fs2` lock on the queue file, so
//! several workers (or processes) can share one queue without claiming the
//! same job twice.
//!
//! This is the outer, run-level retry layer: a failed delivery is requeued
//! with exponential backoff until `max_attempts`, independently of the
//! stage-level retries performed inside the engine.
//!
//! A claim is a lease: the worker renews it while the run is in flight, and a
//! running job whose lease expires (the worker died) is delivered again.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::domain::PipelineContext;

/// Errors that can occur with the job queue
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job transition for {id}: {from} → {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Derived status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly until `available_at`)
    Pending,
    /// Claimed by a worker
    Running,
    Done,
    /// Out of attempts
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,

    /// Pipeline id of the job
    pub job_id: String,

    pub event_type: QueueEventType,

    /// Additional data (depends on event type)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    /// Job added; data carries the pipeline context
    Enqueued,
    /// Delivery started by a worker
    Claimed,
    Completed,
    /// Out of attempts; data carries the error
    Failed,
    /// Back to pending; data carries the backoff deadline
    Requeued,
    /// Heartbeat from the worker holding the claim; data carries the new lease
    Renewed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequeueData {
    available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    reset_attempts: bool,
}

/// A job with current state (derived from replaying events)
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub context: PipelineContext,

    /// Deliveries started so far
    pub attempts: u32,

    /// Earliest time the job may be claimed
    pub available_at: DateTime<Utc>,

    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Error of the most recent failed delivery
    pub error: Option<String>,

    /// Deadline of the current claim while running
    pub lease_until: Option<DateTime<Utc>>,
}

impl Job {
    /// Running, but the worker holding the claim stopped renewing it
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_until.map_or(false, |lease| lease <= now)
    }

    fn is_claimable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Running => self.lease_expired(now) && self.attempts < max_attempts,
            JobStatus::Done | JobStatus::Failed => false,
        }
    }
}

/// Result of enqueueing a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// New job
    Queued(String),
    /// Already pending or running
    AlreadyQueued(String),
    /// Already done
    AlreadyProcessed(String),
    /// Was failed; attempts reset and pending again
    ResetForRetry(String),
}

impl EnqueueResult {
    pub fn id(&self) -> &str {
        match self {
            Self::Queued(id)
            | Self::AlreadyQueued(id)
            | Self::AlreadyProcessed(id)
            | Self::ResetForRetry(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// What happened to a job after a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Pending again after the backoff
    Requeued {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Out of attempts
    Failed { attempts: u32 },
}

/// Queue status summary
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub recent: Vec<Job>,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.done + self.failed
    }
}

/// JSONL-based job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    queue_path: PathBuf,
    max_attempts: u32,
    backoff_ms: u64,
    lease_ms: u64,
}

impl JobQueue {
    /// Queue at `queue_path` with the default requeue policy
    pub fn new(queue_path: impl Into<PathBuf>) -> Self {
        Self::with_config(queue_path, &QueueConfig::default())
    }

    pub fn with_config(queue_path: impl Into<PathBuf>, config: &QueueConfig) -> Self {
        Self {
            queue_path: queue_path.into(),
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.backoff_ms,
            lease_ms: config.lease_ms,
        }
    }

    /// Open the queue, creating its directory if needed
    pub async fn open(queue_path: impl Into<PathBuf>, config: &QueueConfig) -> Result<Self, JobQueueError> {
        let queue = Self::with_config(queue_path, config);
        if let Some(parent) = queue.queue_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.queue_path
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How long a claim stays valid without renewal
    pub fn lease(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lease_ms)
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::milliseconds(i64::try_from(self.lease_ms).unwrap_or(i64::MAX))
    }

    /// Delay before redelivery after failed attempt `attempt` (1-indexed)
    pub fn backoff_after(&self, attempt: u32) -> ChronoDuration {
        let shift = attempt.saturating_sub(1).min(31);
        let ms = self.backoff_ms.saturating_mul(1u64 << shift);
        ChronoDuration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    /// Enqueue a run (idempotent on the pipeline id)
    pub async fn enqueue(&self, context: &PipelineContext) -> Result<EnqueueResult, JobQueueError> {
        let context = context.clone();

        self.transact(move |jobs| {
            let id = context.id.clone();
            let now = Utc::now();

            let (event_type, data, result) = match jobs.get(&id).map(|job| job.status) {
                Some(JobStatus::Done) => return Ok((Vec::new(), EnqueueResult::AlreadyProcessed(id))),
                Some(JobStatus::Pending | JobStatus::Running) => {
                    return Ok((Vec::new(), EnqueueResult::AlreadyQueued(id)))
                }
                Some(JobStatus::Failed) => {
                    let data = RequeueData {
                        available_at: now,
                        error: None,
                        reset_attempts: true,
                    };
                    (
                        QueueEventType::Requeued,
                        serde_json::to_value(&data)?,
                        EnqueueResult::ResetForRetry(id.clone()),
                    )
                }
                None => (
                    QueueEventType::Enqueued,
                    serde_json::to_value(&context)?,
                    EnqueueResult::Queued(id.clone()),
                ),
            };

            let event = QueueEvent {
                timestamp: now,
                job_id: id,
                event_type,
                data: Some(data),
            };
            Ok((vec![event], result))
        })
        .await
    }

    /// Claim the oldest pending job whose backoff has elapsed.
    ///
    /// A running job whose lease ran out counts as abandoned: it is claimed
    /// again as a new attempt, or failed when it has no attempts left.
    pub async fn claim_next(&self) -> Result<Option<Job>, JobQueueError> {
        let queue = self.clone();
        let max_attempts = self.max_attempts;

        self.transact(move |jobs| {
            let now = Utc::now();
            let mut events = Vec::new();

            for job in jobs
                .values()
                .filter(|job| job.lease_expired(now) && job.attempts >= max_attempts)
            {
                warn!(job_id = %job.id, attempts = job.attempts, "Claim expired with no attempts left");
                events.push(QueueEvent {
                    timestamp: now,
                    job_id: job.id.clone(),
                    event_type: QueueEventType::Failed,
                    data: Some(serde_json::json!({
                        "error": format!("claim expired after {} attempts", job.attempts),
                    })),
                });
            }

            let next = jobs
                .values()
                .filter(|job| job.is_claimable(now, max_attempts))
                .min_by(|a, b| {
                    a.available_at
                        .cmp(&b.available_at)
                        .then(a.enqueued_at.cmp(&b.enqueued_at))
                })
                .cloned();

            let Some(mut job) = next else {
                return Ok((events, None));
            };

            if job.status == JobStatus::Running {
                warn!(job_id = %job.id, attempt = job.attempts, "Reclaiming job with expired lease");
            }

            let lease_until = queue.lease_from(now);
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.started_at = Some(now);
            job.lease_until = Some(lease_until);

            events.push(QueueEvent {
                timestamp: now,
                job_id: job.id.clone(),
                event_type: QueueEventType::Claimed,
                data: Some(serde_json::json!({ "attempt": job.attempts, "leaseUntil": lease_until })),
            });
            Ok((events, Some(job)))
        })
        .await
    }

    /// Extend the claim on a running job; returns the new deadline
    pub async fn renew(&self, id: &str) -> Result<DateTime<Utc>, JobQueueError> {
        let id = id.to_string();
        let queue = self.clone();

        self.transact(move |jobs| {
            expect_running(jobs, &id, JobStatus::Running)?;

            let now = Utc::now();
            let lease_until = queue.lease_from(now);
            let event = QueueEvent {
                timestamp: now,
                job_id: id,
                event_type: QueueEventType::Renewed,
                data: Some(serde_json::json!({ "leaseUntil": lease_until })),
            };
            Ok((vec![event], lease_until))
        })
        .await
    }

    /// Mark a running job as done
    pub async fn complete(&self, id: &str) -> Result<(), JobQueueError> {
        let id = id.to_string();

        self.transact(move |jobs| {
            expect_running(jobs, &id, JobStatus::Done)?;

            let event = QueueEvent {
                timestamp: Utc::now(),
                job_id: id,
                event_type: QueueEventType::Completed,
                data: None,
            };
            Ok((vec![event], ()))
        })
        .await
    }

    /// Record a failed delivery: requeue with backoff, or fail for good
    pub async fn fail(&self, id: &str, error: &str) -> Result<FailOutcome, JobQueueError> {
        let id = id.to_string();
        let error = error.to_string();
        let max_attempts = self.max_attempts;
        let queue = self.clone();

        self.transact(move |jobs| {
            let attempts = expect_running(jobs, &id, JobStatus::Failed)?.attempts;
            let now = Utc::now();

            let (event, outcome) = if attempts < max_attempts {
                let available_at = now + queue.backoff_after(attempts);
                let data = RequeueData {
                    available_at,
                    error: Some(error),
                    reset_attempts: false,
                };
                let event = QueueEvent {
                    timestamp: now,
                    job_id: id,
                    event_type: QueueEventType::Requeued,
                    data: Some(serde_json::to_value(&data)?),
                };
                (event, FailOutcome::Requeued { attempt: attempts, available_at })
            } else {
                let event = QueueEvent {
                    timestamp: now,
                    job_id: id,
                    event_type: QueueEventType::Failed,
                    data: Some(serde_json::json!({ "error": error })),
                };
                (event, FailOutcome::Failed { attempts })
            };

            Ok((vec![event], outcome))
        })
        .await
    }

    /// Replay all events to build current state
    pub async fn replay(&self) -> Result<HashMap<String, Job>, JobQueueError> {
        let path = self.queue_path.clone();

        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(HashMap::new());
            }

            let file = File::open(&path)?;
            file.lock_shared()?;
            read_jobs(&file)
        })
        .await?
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, JobQueueError> {
        Ok(self.replay().await?.remove(id))
    }

    /// All jobs, oldest first
    pub async fn list(&self) -> Result<Vec<Job>, JobQueueError> {
        let mut jobs: Vec<Job> = self.replay().await?.into_values().collect();
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(jobs)
    }

    /// Get queue status summary
    pub async fn status(&self) -> Result<QueueStatus, JobQueueError> {
        let jobs = self.list().await?;

        let mut status = QueueStatus::default();
        for job in &jobs {
            match job.status {
                JobStatus::Pending => status.pending += 1,
                JobStatus::Running => status.running += 1,
                JobStatus::Done => status.done += 1,
                JobStatus::Failed => status.failed += 1,
            }
        }

        // Most recent five
        status.recent = jobs.into_iter().rev().take(5).collect();
        Ok(status)
    }

    /// Run `f` over the replayed jobs while holding the exclusive lock, then
    /// append the events it returns.
    async fn transact<R, F>(&self, f: F) -> Result<R, JobQueueError>
    where
        F: FnOnce(&HashMap<String, Job>) -> Result<(Vec<QueueEvent>, R), JobQueueError> + Send + 'static,
        R: Send + 'static,
    {
        let path = self.queue_path.clone();

        tokio::task::spawn_blocking(move || {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;

            // Lock is released when file is dropped
            file.lock_exclusive()?;

            let jobs = read_jobs(&file)?;
            let (events, result) = f(&jobs)?;

            if !events.is_empty() {
                file.seek(SeekFrom::End(0))?;
                for event in &events {
                    writeln!(file, "{}", serde_json::to_string(event)?)?;
                    debug!(job_id = %event.job_id, event = ?event.event_type, "Queue event appended");
                }
                file.flush()?;
                file.sync_data()?;
            }

            Ok(result)
        })
        .await?
    }
}

fn expect_running<'a>(
    jobs: &'a HashMap<String, Job>,
    id: &str,
    to: JobStatus,
) -> Result<&'a Job, JobQueueError> {
    let job = jobs
        .get(id)
        .ok_or_else(|| JobQueueError::NotFound(id.to_string()))?;

    if job.status != JobStatus::Running {
        return Err(JobQueueError::InvalidTransition {
            id: id.to_string(),
            from: job.status,
            to,
        });
    }

    Ok(job)
}

/// Replay the log from the start of `file`; undecodable lines are skipped
fn read_jobs(file: &File) -> Result<HashMap<String, Job>, JobQueueError> {
    let mut jobs = HashMap::new();
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<QueueEvent>(&line) {
            Ok(event) => apply_event(&mut jobs, event),
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping corrupt queue entry"),
        }
    }

    Ok(jobs)
}

fn lease_deadline(data: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    data.and_then(|d| d.get("leaseUntil"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Apply a single event to the state
fn apply_event(jobs: &mut HashMap<String, Job>, event: QueueEvent) {
    match event.event_type {
        QueueEventType::Enqueued => {
            let context = event
                .data
                .and_then(|data| serde_json::from_value::<PipelineContext>(data).ok());

            if let Some(context) = context {
                jobs.insert(
                    event.job_id.clone(),
                    Job {
                        id: event.job_id,
                        status: JobStatus::Pending,
                        context,
                        attempts: 0,
                        available_at: event.timestamp,
                        enqueued_at: event.timestamp,
                        started_at: None,
                        completed_at: None,
                        error: None,
                        lease_until: None,
                    },
                );
            }
        }
        QueueEventType::Claimed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.started_at = Some(event.timestamp);
                job.completed_at = None;
                job.lease_until = lease_deadline(event.data.as_ref());
            }
        }
        QueueEventType::Renewed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                if job.status == JobStatus::Running {
                    job.lease_until = lease_deadline(event.data.as_ref()).or(job.lease_until);
                }
            }
        }
        QueueEventType::Completed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Done;
                job.completed_at = Some(event.timestamp);
                job.error = None;
                job.lease_until = None;
            }
        }
        QueueEventType::Failed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Failed;
                job.completed_at = Some(event.timestamp);
                job.lease_until = None;
                if let Some(error) = event.data.as_ref().and_then(|d| d.get("error")).and_then(|e| e.as_str()) {
                    job.error = Some(error.to_string());
                }
            }
        }
        QueueEventType::Requeued => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                let data = event
                    .data
                    .and_then(|data| serde_json::from_value::<RequeueData>(data).ok());

                job.status = JobStatus::Pending;
                job.started_at = None;
                job.completed_at = None;
                job.lease_until = None;
                job.available_at = data.as_ref().map(|d| d.available_at).unwrap_or(event.timestamp);

                if let Some(data) = data {
                    if data.reset_attempts {
                        job.attempts = 0;
                        job.error = None;
                    } else if data.error.is_some() {
                        job.error = data.error;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VideoFormat;
    use tempfile::TempDir;

    fn create_test_queue(temp: &TempDir, max_attempts: u32, backoff_ms: u64) -> JobQueue {
        let config = QueueConfig {
            max_attempts,
            backoff_ms,
            ..Default::default()
        };
        JobQueue::with_config(temp.path().join("queue.jsonl"), &config)
    }

    fn leased_queue(path: &Path, max_attempts: u32, lease_ms: u64) -> JobQueue {
        let config = QueueConfig {
            max_attempts,
            backoff_ms: 0,
            lease_ms,
            ..Default::default()
        };
        JobQueue::with_config(path, &config)
    }

    fn context(topic: &str) -> PipelineContext {
        PipelineContext::new(topic, VideoFormat::Short).unwrap()
    }

    #[tokio::test]
    async fn test_idempotent_enqueue() {
        let temp = TempDir::new().unwrap();
        let queue = create_test_queue(&temp, 3, 0);
        let ctx = context("rust");

        let first = queue.enqueue(&ctx).await.unwrap();
        let second = queue.enqueue(&ctx).await.unwrap();

        assert!(first.is_new());
        assert_eq!(second, EnqueueResult::AlreadyQueued(ctx.id.clone()));
        assert_eq!(queue.status().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_claim_then_complete() {
        let temp = TempDir::new().unwrap();
        let queue = create_test_queue(&temp, 3, 0);
        let ctx = context("rust");
        queue.enqueue(&ctx).await.unwrap();

        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, ctx.id);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.context, ctx);

        // Nothing else is claimable while the job runs
        assert!(queue.claim_next().await.unwrap().is_none());

        queue.complete(&job.id).await.unwrap();
        let job = queue.get(&ctx.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);

        let again = queue.enqueue(&ctx).await.unwrap();
        assert_eq!(again, EnqueueResult::AlreadyProcessed(ctx.id));
    }

    #[tokio::test]
    async fn test_failures_requeue_until_max_attempts() {
        let temp = TempDir::new().unwrap();
        let queue = create_test_queue(&temp, 2, 0);
        let ctx = context("rust");
        queue.enqueue(&ctx).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        let outcome = queue.fail(&ctx.id, "stage failed").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Requeued { attempt: 1, .. }));

        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error.as_deref(), Some("stage failed"));

        let outcome = queue.fail(&ctx.id, "stage failed again").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts: 2 });

        let job = queue.get(&ctx.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("stage failed again"));

        // Re-enqueueing a failed job starts over
        let reset = queue.enqueue(&ctx).await.unwrap();
        assert_eq!(reset, EnqueueResult::ResetForRetry(ctx.id.clone()));
        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_backoff_delays_redelivery() {
        let temp = TempDir::new().unwrap();
        let queue = create_test_queue(&temp, 3, 60_000);
        let ctx = context("rust");
        queue.enqueue(&ctx).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        queue.fail(&ctx.id, "boom").await.unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.status().await.unwrap().pending, 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let queue = JobQueue::with_config(
            "/tmp/unused.jsonl",
            &QueueConfig {
                backoff_ms: 2000,
                ..Default::default()
            },
        );

        assert_eq!(queue.backoff_after(1), ChronoDuration::milliseconds(2000));
        assert_eq!(queue.backoff_after(2), ChronoDuration::milliseconds(4000));
        assert_eq!(queue.backoff_after(3), ChronoDuration::milliseconds(8000));
    }

    #[tokio::test]
    async fn test_complete_requires_running_job() {
        let temp = TempDir::new().unwrap();
        let queue = create_test_queue(&temp, 3, 0);
        let ctx = context("rust");
        queue.enqueue(&ctx).await.unwrap();

        let err = queue.complete(&ctx.id).await.unwrap_err();
        assert!(matches!(err, JobQueueError::InvalidTransition { from: JobStatus::Pending, .. }));
        assert!(matches!(queue.complete("missing").await, Err(JobQueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_redelivered() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.jsonl");
        let ctx = context("rust");

        {
            // Worker claims the job and dies without completing it
            let queue = leased_queue(&path, 3, 50);
            queue.enqueue(&ctx).await.unwrap();
            let job = queue.claim_next().await.unwrap().unwrap();
            assert!(job.lease_until.is_some());
        }

        let queue = leased_queue(&path, 3, 50);
        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.enqueue(&ctx).await.unwrap(), EnqueueResult::AlreadyQueued(ctx.id.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let job = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, ctx.id);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.status, JobStatus::Running);

        queue.complete(&ctx.id).await.unwrap();
        assert_eq!(queue.get(&ctx.id).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_expired_claim_without_attempts_left_fails() {
        let temp = TempDir::new().unwrap();
        let queue = leased_queue(&temp.path().join("queue.jsonl"), 1, 10);
        let ctx = context("rust");
        queue.enqueue(&ctx).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert!(queue.claim_next().await.unwrap().is_none());
        let job = queue.get(&ctx.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.lease_until.is_none());
        assert!(job.error.as_deref().unwrap().contains("claim expired"));
    }

    #[tokio::test]
    async fn test_renewed_claim_is_not_redelivered() {
        let temp = TempDir::new().unwrap();
        let queue = leased_queue(&temp.path().join("queue.jsonl"), 3, 200);
        let ctx = context("rust");
        queue.enqueue(&ctx).await.unwrap();
        let job = queue.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        let renewed = queue.renew(&ctx.id).await.unwrap();
        assert!(renewed > job.lease_until.unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.get(&ctx.id).await.unwrap().unwrap().lease_until, Some(renewed));

        // Only the holder of a running job may renew it
        queue.complete(&ctx.id).await.unwrap();
        assert!(queue.renew(&ctx.id).await.is_err());
    }
}
