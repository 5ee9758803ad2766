//! faceless - Durable orchestrator for faceless video pipelines
//!
//! Drives a video through a fixed sequence of eight stages (keyword
//! research, script, narration, assembly, thumbnail, metadata, upload and
//! A/B test), persisting per-stage status so a failed run shows exactly
//! where and why it stopped.
//!
//! # Architecture
//!
//! - Every stage call is wrapped in bounded exponential-backoff retry
//! - Stage status is persisted per run after every transition
//! - Lifecycle events are published on a topic exchange as a side channel
//! - Runs are queued and drained by workers with an outer retry layer
//!
//! # Modules
//!
//! - `config`: Configuration resolution (.faceless/config.yaml, env)
//! - `core`: Orchestration logic (StateStore, Retry, EventBus, Engine)
//! - `domain`: Data structures (Context, State, Stage I/O, Events)
//! - `stages`: Stage capabilities and the static registry
//! - `worker`: Job queue and worker
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline inline
//! faceless run --topic "rust ownership" --format short
//!
//! # Queue a pipeline and process it
//! faceless enqueue --topic "rust ownership"
//! faceless worker --once
//!
//! # Check run status
//! faceless status <pipeline-id>
//!
//! # Resume a failed run
//! faceless resume <pipeline-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod stages;
pub mod worker;

// Re-export main types at crate root for convenience
pub use core::{PipelineEngine, PipelineError, RerunPolicy, StateStore};
pub use domain::{PipelineContext, PipelineState, StageName, StageState, StageStatus, VideoFormat};
pub use stages::{Capability, StageRegistry};
pub use worker::{JobQueue, Worker};
