//! Pipeline engine.
//!
//! Drives one run through the fixed stage sequence. For every stage the
//! engine records `running`, publishes `pipeline.<stage>.started`, calls the
//! capability through the retry executor, stores the output as an artifact,
//! then records and publishes exactly one terminal outcome. The first stage
//! that exhausts its retries aborts the run.
//!
//! The engine holds no per-run state: every dependency is injected at
//! construction and one value can drive any number of runs.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::StageSettings;
use crate::domain::{
    AbTestInput, AbTestOutput, KeywordFetchInput, KeywordFetchOutput, MetadataBuildInput,
    PipelineContext, PipelineState, ScriptGenerateInput, ScriptGenerateOutput, StageName,
    StagePhase, StageStatusPatch, ThumbnailMakeInput, ThumbnailMakeOutput, TtsRenderInput,
    TtsRenderOutput, UploadInput, UploadOutput, Variant, VideoAssembleInput, VideoAssembleOutput,
    VideoMetadata,
};
use crate::stages::{Capability, StageError, StageRegistry};

use super::artifact_store::ArtifactStore;
use super::event_bus::EventPublisher;
use super::retry::{RetriesExhausted, RetryExecutor};
use super::state_store::{StateStore, StateStoreError};

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline context: {0}")]
    InvalidContext(String),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error("Artifact store error: {0}")]
    Artifact(String),

    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: StageName,
        #[source]
        source: RetriesExhausted<StageError>,
    },
}

impl PipelineError {
    /// Stage that aborted the run, if a stage did
    pub fn failed_stage(&self) -> Option<StageName> {
        match self {
            Self::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Last error reported by the failing stage
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            Self::StageFailed { source, .. } => Some(&source.last_error),
            _ => None,
        }
    }
}

/// What to do with a run whose state already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RerunPolicy {
    /// Reset every step and run all stages again
    #[default]
    Restart,

    /// Reuse stages that completed and still have their artifact; run the rest
    Resume,
}

/// Outputs of every stage of a successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutputs {
    pub keyword_fetch: KeywordFetchOutput,
    pub script_generate: ScriptGenerateOutput,
    pub tts_render: TtsRenderOutput,
    pub video_assemble: VideoAssembleOutput,
    pub thumbnail_make: ThumbnailMakeOutput,
    pub metadata_build: VideoMetadata,
    pub upload: UploadOutput,
    pub ab_test: AbTestOutput,
}

/// Result of a run in which all eight stages completed
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub state: PipelineState,
    pub outputs: RunOutputs,
}

/// Sequential executor for the fixed stage sequence
pub struct PipelineEngine {
    store: StateStore,
    artifacts: ArtifactStore,
    stages: StageRegistry,
    events: Arc<dyn EventPublisher>,
    retry: RetryExecutor,
    rerun: RerunPolicy,
    settings: StageSettings,
}

impl PipelineEngine {
    /// Engine with the default retry policy and `RerunPolicy::Restart`
    pub fn new(
        store: StateStore,
        artifacts: ArtifactStore,
        stages: StageRegistry,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            artifacts,
            stages,
            events,
            retry: RetryExecutor::default(),
            rerun: RerunPolicy::default(),
            settings: StageSettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rerun_policy(mut self, rerun: RerunPolicy) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn with_stage_settings(mut self, settings: StageSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn rerun_policy(&self) -> RerunPolicy {
        self.rerun
    }

    /// Run every stage for `context`, in order.
    ///
    /// Returns the final state and all outputs, or the first run-aborting
    /// error. A failed stage is persisted as `failed` with its error message
    /// before this returns.
    #[instrument(skip(self, context), fields(pipeline_id = %context.id))]
    pub async fn execute(&self, context: &PipelineContext) -> Result<CompletedRun, PipelineError> {
        context.validate().map_err(PipelineError::InvalidContext)?;

        let mut reusable = self.prepare(context).await?;
        info!(topic = %context.topic, format = %context.format, reusable, "Pipeline started");

        let keyword_fetch = self
            .run_stage(
                context,
                &*self.stages.keyword_fetch,
                StageName::KeywordFetch,
                keyword_fetch_input(context),
                &mut reusable,
            )
            .await?;

        let script_generate = self
            .run_stage(
                context,
                &*self.stages.script_generate,
                StageName::ScriptGenerate,
                script_generate_input(context, &keyword_fetch),
                &mut reusable,
            )
            .await?;

        let tts_render = self
            .run_stage(
                context,
                &*self.stages.tts_render,
                StageName::TtsRender,
                tts_render_input(&script_generate, &self.settings),
                &mut reusable,
            )
            .await?;

        let video_assemble = self
            .run_stage(
                context,
                &*self.stages.video_assemble,
                StageName::VideoAssemble,
                video_assemble_input(&script_generate, &tts_render, &self.settings),
                &mut reusable,
            )
            .await?;

        let thumbnail_make = self
            .run_stage(
                context,
                &*self.stages.thumbnail_make,
                StageName::ThumbnailMake,
                thumbnail_make_input(&script_generate, &video_assemble),
                &mut reusable,
            )
            .await?;

        let metadata_build = self
            .run_stage(
                context,
                &*self.stages.metadata_build,
                StageName::MetadataBuild,
                metadata_build_input(&script_generate, &video_assemble, &thumbnail_make),
                &mut reusable,
            )
            .await?;

        let upload = self
            .run_stage(
                context,
                &*self.stages.upload,
                StageName::Upload,
                upload_input(&video_assemble, &thumbnail_make, &metadata_build),
                &mut reusable,
            )
            .await?;

        let ab_test = self
            .run_stage(
                context,
                &*self.stages.ab_test,
                StageName::AbTest,
                ab_test_input(&upload, &metadata_build),
                &mut reusable,
            )
            .await?;

        let state = self
            .store
            .load(&context.id)
            .await?
            .ok_or_else(|| StateStoreError::NoSuchPipeline(context.id.clone()))?;

        info!(video_id = %upload.video_id, "Pipeline completed");

        Ok(CompletedRun {
            state,
            outputs: RunOutputs {
                keyword_fetch,
                script_generate,
                tts_render,
                video_assemble,
                thumbnail_make,
                metadata_build,
                upload,
                ab_test,
            },
        })
    }

    /// Ensure a state record exists and return how many leading stages may
    /// reuse their stored output.
    async fn prepare(&self, context: &PipelineContext) -> Result<usize, PipelineError> {
        let existing = self.store.load(&context.id).await?;

        match (existing, self.rerun) {
            (None, _) => {
                self.store.create(context).await?;
                Ok(0)
            }
            (Some(_), RerunPolicy::Restart) => {
                info!("State exists, restarting all stages");
                self.store.create(context).await?;
                Ok(0)
            }
            (Some(mut state), RerunPolicy::Resume) => {
                let stored = self
                    .artifacts
                    .list(&context.id)
                    .await
                    .map_err(|e| PipelineError::Artifact(format!("{:#}", e)))?;

                let reusable = StageName::ALL
                    .iter()
                    .take_while(|s| state.is_stage_completed(**s) && stored.contains(s))
                    .count();

                retain_before(&mut state, reusable);
                self.store.save(&state).await?;

                info!(reusable, "Resuming from stored state");
                Ok(reusable)
            }
        }
    }

    /// Drop every step record from `stage` onwards so it can run again
    async fn reset_from(&self, id: &str, stage: StageName) -> Result<(), PipelineError> {
        let mut state = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| StateStoreError::NoSuchPipeline(id.to_string()))?;

        retain_before(&mut state, stage.position());
        self.store.save(&state).await?;
        Ok(())
    }

    async fn run_stage<C>(
        &self,
        context: &PipelineContext,
        capability: &C,
        stage: StageName,
        input: C::Input,
        reusable: &mut usize,
    ) -> Result<C::Output, PipelineError>
    where
        C: Capability + ?Sized,
    {
        let id = context.id.as_str();

        if stage.position() < *reusable {
            let stored = self
                .artifacts
                .load::<C::Output>(id, stage)
                .await
                .map_err(|e| PipelineError::Artifact(format!("{:#}", e)))?;

            if let Some(output) = stored {
                info!(%stage, "Reusing stored output");
                return Ok(output);
            }

            warn!(%stage, "Stored output unusable, re-running from this stage");
            self.reset_from(id, stage).await?;
            *reusable = stage.position();
        }

        let started_at = Utc::now();
        self.store
            .update_stage_status(id, stage, &StageStatusPatch::running(started_at))
            .await?;

        info!(%stage, implementation = capability.name(), "Stage started");
        self.notify(
            stage.topic(StagePhase::Started),
            json!({
                "pipelineId": id,
                "stage": stage.as_str(),
                "startedAt": started_at,
            }),
        )
        .await;

        let mut retries = 0u32;
        let input = &input;
        let result = self
            .retry
            .run_observed(
                move || async move {
                    capability
                        .execute(input, context)
                        .await
                        .map_err(|e| stage_error(stage, e))
                },
                |failure| retries = failure.attempt,
            )
            .await;

        let output = match result {
            Ok(output) => output,
            Err(exhausted) => {
                let message = exhausted.last_error.to_string();
                let retry_count = exhausted.attempts.saturating_sub(1);
                self.fail_stage(id, stage, &message, retry_count).await?;

                return Err(PipelineError::StageFailed {
                    stage,
                    source: exhausted,
                });
            }
        };

        if let Err(e) = self.artifacts.save(id, stage, &output).await {
            let message = format!("Failed to store artifact: {:#}", e);
            self.fail_stage(id, stage, &message, retries).await?;
            return Err(PipelineError::Artifact(message));
        }

        let completed_at = Utc::now();
        if let Err(e) = self
            .store
            .update_stage_status(id, stage, &StageStatusPatch::completed(completed_at, retries))
            .await
        {
            // The stage ran but its outcome is not on disk; report it as failed
            let message = format!("Failed to record completion: {}", e);
            if let Err(record_err) = self.fail_stage(id, stage, &message, retries).await {
                warn!(%stage, error = %record_err, "Failure could not be recorded either");
            }
            return Err(e.into());
        }

        info!(%stage, retries, "Stage completed");
        self.notify(
            stage.topic(StagePhase::Completed),
            json!({
                "pipelineId": id,
                "stage": stage.as_str(),
                "completedAt": completed_at,
                "retryCount": retries,
                "output": serde_json::to_value(&output).unwrap_or_default(),
            }),
        )
        .await;

        Ok(output)
    }

    async fn fail_stage(
        &self,
        id: &str,
        stage: StageName,
        message: &str,
        retry_count: u32,
    ) -> Result<(), PipelineError> {
        let failed_at = Utc::now();
        let recorded = self
            .store
            .update_stage_status(id, stage, &StageStatusPatch::failed(failed_at, message, retry_count))
            .await;

        // The failed event goes out even when the state write did not
        error!(%stage, error = %message, "Stage failed");
        self.notify(
            stage.topic(StagePhase::Failed),
            json!({
                "pipelineId": id,
                "stage": stage.as_str(),
                "failedAt": failed_at,
                "retryCount": retry_count,
                "error": message,
            }),
        )
        .await;

        recorded?;
        Ok(())
    }

    /// Publish a lifecycle event; failures are logged and swallowed
    async fn notify(&self, topic: String, payload: Value) {
        if let Err(e) = self.events.publish(&topic, payload).await {
            warn!(topic = %topic, error = %e, "Failed to publish event");
        }
    }
}

fn retain_before(state: &mut PipelineState, position: usize) {
    state.steps.retain(|name, _| {
        name.parse::<StageName>()
            .map(|s| s.position() < position)
            .unwrap_or(false)
    });
}

/// Keep a stage's own rejection as is; wrap anything else as an execution failure
fn stage_error(stage: StageName, error: anyhow::Error) -> StageError {
    match error.downcast_ref::<StageError>() {
        Some(stage_error) => stage_error.clone(),
        None => StageError::Execution {
            stage,
            message: format!("{:#}", error),
        },
    }
}

// Stage inputs, one builder per row of the dependency table.

pub fn keyword_fetch_input(context: &PipelineContext) -> KeywordFetchInput {
    KeywordFetchInput {
        topic: context.topic.clone(),
        format: context.format,
    }
}

pub fn script_generate_input(
    context: &PipelineContext,
    keywords: &KeywordFetchOutput,
) -> ScriptGenerateInput {
    ScriptGenerateInput {
        topic: context.topic.clone(),
        keywords: keywords.keywords.clone(),
        format: context.format,
    }
}

pub fn tts_render_input(script: &ScriptGenerateOutput, settings: &StageSettings) -> TtsRenderInput {
    TtsRenderInput {
        script: script.script.clone(),
        voice: settings.voice.clone(),
        speed: settings.speed,
    }
}

pub fn video_assemble_input(
    script: &ScriptGenerateOutput,
    audio: &TtsRenderOutput,
    settings: &StageSettings,
) -> VideoAssembleInput {
    VideoAssembleInput {
        script: script.script.clone(),
        audio_path: audio.audio_path.clone(),
        background_video: settings.background_video.clone(),
    }
}

pub fn thumbnail_make_input(
    script: &ScriptGenerateOutput,
    video: &VideoAssembleOutput,
) -> ThumbnailMakeInput {
    ThumbnailMakeInput {
        script: script.script.clone(),
        video_path: video.video_path.clone(),
    }
}

pub fn metadata_build_input(
    script: &ScriptGenerateOutput,
    video: &VideoAssembleOutput,
    thumbnail: &ThumbnailMakeOutput,
) -> MetadataBuildInput {
    MetadataBuildInput {
        script: script.script.clone(),
        video_path: video.video_path.clone(),
        thumbnail_path: thumbnail.thumbnail_path.clone(),
    }
}

pub fn upload_input(
    video: &VideoAssembleOutput,
    thumbnail: &ThumbnailMakeOutput,
    metadata: &VideoMetadata,
) -> UploadInput {
    UploadInput {
        video_path: video.video_path.clone(),
        thumbnail_path: thumbnail.thumbnail_path.clone(),
        metadata: metadata.clone(),
    }
}

/// Two variants: the title and the description as alternative descriptions
pub fn ab_test_input(upload: &UploadOutput, metadata: &VideoMetadata) -> AbTestInput {
    let variants = [&metadata.title, &metadata.description]
        .iter()
        .enumerate()
        .map(|(i, text)| Variant {
            title: format!("{} ({})", metadata.title, i),
            description: text.to_string(),
        })
        .collect();

    AbTestInput {
        video_id: upload.video_id.clone(),
        variants,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PrivacyStatus, VideoFormat};

    #[test]
    fn test_ab_variants_from_metadata() {
        let upload = UploadOutput {
            video_id: "vid-1".to_string(),
            url: "https://youtube.com/watch?v=vid-1".to_string(),
            upload_date: Utc::now(),
        };
        let metadata = VideoMetadata {
            title: "Rust".to_string(),
            description: "All about Rust".to_string(),
            tags: vec![],
            category_id: None,
            privacy_status: PrivacyStatus::Private,
        };

        let input = ab_test_input(&upload, &metadata);

        assert_eq!(input.video_id, "vid-1");
        assert_eq!(
            input.variants,
            vec![
                Variant {
                    title: "Rust (0)".to_string(),
                    description: "Rust".to_string(),
                },
                Variant {
                    title: "Rust (1)".to_string(),
                    description: "All about Rust".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_settings_thread_into_tts_input() {
        let script = ScriptGenerateOutput {
            script: crate::domain::Script {
                title: "t".to_string(),
                description: "d".to_string(),
                transcript: "x".to_string(),
                segments: vec![],
                tags: vec![],
            },
        };
        let settings = StageSettings {
            voice: Some("alloy".to_string()),
            speed: Some(1.25),
            ..Default::default()
        };

        let input = tts_render_input(&script, &settings);
        assert_eq!(input.voice.as_deref(), Some("alloy"));
        assert_eq!(input.speed, Some(1.25));
    }

    #[test]
    fn test_retain_before_drops_later_steps() {
        let context = PipelineContext::new("Rust", VideoFormat::Short).unwrap();
        let mut state = PipelineState::new(context);
        for stage in StageName::ALL {
            state.steps.insert(stage.as_str().to_string(), Default::default());
        }

        retain_before(&mut state, 3);

        assert_eq!(state.steps.len(), 3);
        assert!(state.stage(StageName::TtsRender).is_some());
        assert!(state.stage(StageName::VideoAssemble).is_none());
    }

    #[test]
    fn test_foreign_errors_become_execution_failures() {
        let err = stage_error(StageName::Upload, anyhow::anyhow!("quota exceeded"));
        assert!(matches!(err, StageError::Execution { stage: StageName::Upload, ref message } if message == "quota exceeded"));

        let rejected: anyhow::Error = StageError::InvalidInput {
            stage: StageName::Upload,
            reason: "no video".to_string(),
        }
        .into();
        assert!(matches!(stage_error(StageName::Upload, rejected), StageError::InvalidInput { .. }));
    }
}
