//! Domain types for the pipeline orchestrator.
//!
//! This module contains the core data structures:
//! - Context: Identity and parameters of a run
//! - State: Per-stage status and the durable pipeline aggregate
//! - Stage: The fixed stage sequence
//! - Media: Typed stage inputs and outputs
//! - Events: Bus message envelope

pub mod context;
pub mod events;
pub mod media;
pub mod stage;
pub mod state;

// Re-export commonly used types
pub use context::{validate_pipeline_id, PipelineContext, VideoFormat};
pub use events::{
    EventEnvelope, TOPIC_PIPELINE_COMPLETED, TOPIC_PIPELINE_FAILED, TOPIC_PIPELINE_QUEUED,
};
pub use media::{
    AbTestInput, AbTestOutput, Keyword, KeywordFetchInput, KeywordFetchOutput,
    MetadataBuildInput, PrivacyStatus, Script, ScriptGenerateInput, ScriptGenerateOutput,
    ScriptSegment, ThumbnailMakeInput, ThumbnailMakeOutput, TtsRenderInput, TtsRenderOutput,
    UploadInput, UploadOutput, Variant, VideoAssembleInput, VideoAssembleOutput, VideoMetadata,
};
pub use stage::{StageName, StagePhase};
pub use state::{PipelineState, RunSummary, StageState, StageStatus, StageStatusPatch};
