//! Metadata, upload and A/B test placeholders.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::domain::{
    AbTestInput, AbTestOutput, MetadataBuildInput, PipelineContext, PrivacyStatus, StageName,
    UploadInput, UploadOutput, VideoMetadata,
};

use super::{ensure_valid, Capability};

/// Derives upload metadata from the script
#[derive(Debug, Clone)]
pub struct PlaceholderMetadataBuilder {
    privacy_status: PrivacyStatus,
    category_id: Option<String>,
}

impl PlaceholderMetadataBuilder {
    pub fn new(privacy_status: PrivacyStatus, category_id: Option<String>) -> Self {
        Self {
            privacy_status,
            category_id,
        }
    }
}

#[async_trait]
impl Capability for PlaceholderMetadataBuilder {
    type Input = MetadataBuildInput;
    type Output = VideoMetadata;

    fn name(&self) -> &str {
        "metadata-builder"
    }

    async fn execute(&self, input: &MetadataBuildInput, _context: &PipelineContext) -> Result<VideoMetadata> {
        ensure_valid(
            StageName::MetadataBuild,
            self.validate(input),
            "video and thumbnail paths are required",
        )?;
        info!(title = %input.script.title, "Building metadata");

        let metadata = VideoMetadata {
            title: input.script.title.clone(),
            description: input.script.description.clone(),
            tags: input.script.tags.clone(),
            category_id: self.category_id.clone(),
            privacy_status: self.privacy_status,
        };

        info!(title = %metadata.title, privacy = %metadata.privacy_status, "Metadata built");
        Ok(metadata)
    }

    fn validate(&self, input: &MetadataBuildInput) -> bool {
        !input.video_path.as_os_str().is_empty() && !input.thumbnail_path.as_os_str().is_empty()
    }
}

/// Pretends to upload and returns an id derived from the pipeline id
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderUploader;

#[async_trait]
impl Capability for PlaceholderUploader {
    type Input = UploadInput;
    type Output = UploadOutput;

    fn name(&self) -> &str {
        "uploader"
    }

    async fn execute(&self, input: &UploadInput, context: &PipelineContext) -> Result<UploadOutput> {
        ensure_valid(StageName::Upload, self.validate(input), "video and thumbnail paths are required")?;
        info!(title = %input.metadata.title, "Uploading video");

        let output = UploadOutput {
            video_id: format!("fake-video-{}", context.id),
            url: format!("https://youtube.com/watch?v=fake-{}", context.id),
            upload_date: Utc::now(),
        };

        info!(video_id = %output.video_id, "Video uploaded");
        Ok(output)
    }

    fn validate(&self, input: &UploadInput) -> bool {
        !input.video_path.as_os_str().is_empty() && !input.thumbnail_path.as_os_str().is_empty()
    }
}

/// Registers one variant id per candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderAbTester;

#[async_trait]
impl Capability for PlaceholderAbTester {
    type Input = AbTestInput;
    type Output = AbTestOutput;

    fn name(&self) -> &str {
        "ab-tester"
    }

    async fn execute(&self, input: &AbTestInput, context: &PipelineContext) -> Result<AbTestOutput> {
        ensure_valid(StageName::AbTest, self.validate(input), "a video id and at least one variant are required")?;
        info!(video_id = %input.video_id, variants = input.variants.len(), "Running A/B test");

        let output = AbTestOutput {
            test_id: format!("test-{}", context.id),
            variant_ids: (0..input.variants.len()).map(|i| format!("variant-{}", i)).collect(),
        };

        info!(test_id = %output.test_id, "A/B test created");
        Ok(output)
    }

    fn validate(&self, input: &AbTestInput) -> bool {
        !input.video_id.is_empty() && !input.variants.is_empty()
    }
}
