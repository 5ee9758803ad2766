//! Core orchestration logic.
//!
//! This module contains:
//! - StateStore: Durable per-run stage status
//! - ArtifactStore: Per-run stage outputs
//! - Retry: Bounded retry with exponential backoff
//! - Broker / EventBus: Topic-routed lifecycle notifications
//! - Engine: Sequential execution of the fixed stage sequence

pub mod artifact_store;
pub mod broker;
pub mod engine;
pub mod event_bus;
pub mod retry;
pub mod state_store;

// Re-export commonly used types
pub use artifact_store::ArtifactStore;
pub use broker::{topic_matches, Broker, BrokerChannel, BrokerStats, Delivery, MemoryBroker};
pub use engine::{CompletedRun, PipelineEngine, PipelineError, RerunPolicy, RunOutputs};
pub use event_bus::{
    EventBus, EventBusError, EventHandler, EventPublisher, NoopPublisher, RecordingPublisher,
    Subscription,
};
pub use retry::{AttemptFailure, RetriesExhausted, RetryExecutor, RetryPolicy};
pub use state_store::{StateStore, StateStoreError};
