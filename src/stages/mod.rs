//! Stage capabilities.
//!
//! A capability is the opaque `execute(input, context) -> output` contract
//! the engine calls for each stage. Implementations are registered
//! statically in a [`StageRegistry`] and injected into the engine:
//! - `research`: keyword fetching and script generation placeholders
//! - `render`: TTS, video assembly and thumbnail placeholders
//! - `publishing`: metadata, upload and A/B test placeholders
//! - `http`: remote stage services reached over HTTP

pub mod http;
pub mod publishing;
pub mod render;
pub mod research;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::config::StageSettings;
use crate::domain::{
    AbTestInput, AbTestOutput, KeywordFetchInput, KeywordFetchOutput, MetadataBuildInput,
    PipelineContext, ScriptGenerateInput, ScriptGenerateOutput, StageName, ThumbnailMakeInput,
    ThumbnailMakeOutput, TtsRenderInput, TtsRenderOutput, UploadInput, UploadOutput,
    VideoAssembleInput, VideoAssembleOutput, VideoMetadata,
};

pub use http::HttpStage;
pub use publishing::{PlaceholderAbTester, PlaceholderMetadataBuilder, PlaceholderUploader};
pub use render::{PlaceholderThumbnailMaker, PlaceholderTtsRenderer, PlaceholderVideoAssembler};
pub use research::{PlaceholderKeywordFetcher, PlaceholderScriptGenerator};

/// Stage-level failure reported to the engine
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("stage '{stage}' rejected its input: {reason}")]
    InvalidInput { stage: StageName, reason: String },

    #[error("stage '{stage}' failed: {message}")]
    Execution { stage: StageName, message: String },
}

impl StageError {
    pub fn stage(&self) -> StageName {
        match self {
            Self::InvalidInput { stage, .. } | Self::Execution { stage, .. } => *stage,
        }
    }
}

/// Uniform stage contract
#[async_trait]
pub trait Capability: Send + Sync {
    type Input: Serialize + Send + Sync;
    type Output: Serialize + DeserializeOwned + Send + Sync;

    /// Human-readable implementation name
    fn name(&self) -> &str;

    /// Run the stage for one pipeline
    async fn execute(&self, input: &Self::Input, context: &PipelineContext) -> Result<Self::Output>;

    /// Cheap structural check of the input
    fn validate(&self, _input: &Self::Input) -> bool {
        true
    }
}

pub type KeywordFetcher = dyn Capability<Input = KeywordFetchInput, Output = KeywordFetchOutput>;
pub type ScriptGenerator = dyn Capability<Input = ScriptGenerateInput, Output = ScriptGenerateOutput>;
pub type TtsRenderer = dyn Capability<Input = TtsRenderInput, Output = TtsRenderOutput>;
pub type VideoAssembler = dyn Capability<Input = VideoAssembleInput, Output = VideoAssembleOutput>;
pub type ThumbnailMaker = dyn Capability<Input = ThumbnailMakeInput, Output = ThumbnailMakeOutput>;
pub type MetadataBuilder = dyn Capability<Input = MetadataBuildInput, Output = VideoMetadata>;
pub type Uploader = dyn Capability<Input = UploadInput, Output = UploadOutput>;
pub type AbTester = dyn Capability<Input = AbTestInput, Output = AbTestOutput>;

/// Static mapping of every stage to its implementation
#[derive(Clone)]
pub struct StageRegistry {
    pub keyword_fetch: Arc<KeywordFetcher>,
    pub script_generate: Arc<ScriptGenerator>,
    pub tts_render: Arc<TtsRenderer>,
    pub video_assemble: Arc<VideoAssembler>,
    pub thumbnail_make: Arc<ThumbnailMaker>,
    pub metadata_build: Arc<MetadataBuilder>,
    pub upload: Arc<Uploader>,
    pub ab_test: Arc<AbTester>,
}

impl StageRegistry {
    /// Local placeholder implementations writing under `settings.output_dir`
    pub fn placeholders(settings: &StageSettings) -> Self {
        Self {
            keyword_fetch: Arc::new(PlaceholderKeywordFetcher),
            script_generate: Arc::new(PlaceholderScriptGenerator),
            tts_render: Arc::new(PlaceholderTtsRenderer::new(settings.output_dir.clone())),
            video_assemble: Arc::new(PlaceholderVideoAssembler::new(settings.output_dir.clone())),
            thumbnail_make: Arc::new(PlaceholderThumbnailMaker::new(settings.output_dir.clone())),
            metadata_build: Arc::new(PlaceholderMetadataBuilder::new(
                settings.privacy_status,
                settings.category_id.clone(),
            )),
            upload: Arc::new(PlaceholderUploader),
            ab_test: Arc::new(PlaceholderAbTester),
        }
    }

    /// Placeholders, except for stages with a configured remote endpoint
    pub fn from_settings(settings: &StageSettings) -> Result<Self> {
        let mut registry = Self::placeholders(settings);
        let client = http::build_client(settings.timeout())?;

        for (stage, base_url) in &settings.endpoints {
            let stage = *stage;
            match stage {
                StageName::KeywordFetch => registry.keyword_fetch = http::remote(&client, stage, base_url),
                StageName::ScriptGenerate => registry.script_generate = http::remote(&client, stage, base_url),
                StageName::TtsRender => registry.tts_render = http::remote(&client, stage, base_url),
                StageName::VideoAssemble => registry.video_assemble = http::remote(&client, stage, base_url),
                StageName::ThumbnailMake => registry.thumbnail_make = http::remote(&client, stage, base_url),
                StageName::MetadataBuild => registry.metadata_build = http::remote(&client, stage, base_url),
                StageName::Upload => registry.upload = http::remote(&client, stage, base_url),
                StageName::AbTest => registry.ab_test = http::remote(&client, stage, base_url),
            }
            tracing::info!(%stage, url = %base_url, "Using remote stage service");
        }

        Ok(registry)
    }

    /// Implementation name registered for each stage, in execution order
    pub fn describe(&self) -> Vec<(StageName, String)> {
        vec![
            (StageName::KeywordFetch, self.keyword_fetch.name().to_string()),
            (StageName::ScriptGenerate, self.script_generate.name().to_string()),
            (StageName::TtsRender, self.tts_render.name().to_string()),
            (StageName::VideoAssemble, self.video_assemble.name().to_string()),
            (StageName::ThumbnailMake, self.thumbnail_make.name().to_string()),
            (StageName::MetadataBuild, self.metadata_build.name().to_string()),
            (StageName::Upload, self.upload.name().to_string()),
            (StageName::AbTest, self.ab_test.name().to_string()),
        ]
    }
}

/// Fail with a stage-level rejection unless `valid`
pub(crate) fn ensure_valid(stage: StageName, valid: bool, reason: &str) -> Result<()> {
    if valid {
        Ok(())
    } else {
        Err(StageError::InvalidInput {
            stage,
            reason: reason.to_string(),
        }
        .into())
    }
}
