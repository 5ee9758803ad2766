//! Media rendering placeholders.
//!
//! Each stage writes a stand-in file named after the pipeline id:
//! `audio/<id>.mp3`, `renders/<id>.mp4` and `thumbs/<id>.jpg` under the
//! configured output directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use crate::domain::{
    PipelineContext, StageName, ThumbnailMakeInput, ThumbnailMakeOutput, TtsRenderInput,
    TtsRenderOutput, VideoAssembleInput, VideoAssembleOutput,
};

use super::{ensure_valid, Capability};

/// Seconds reported for placeholder audio and video
const PLACEHOLDER_DURATION: f64 = 60.0;

async fn write_placeholder(dir: PathBuf, file_name: String, contents: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let path = dir.join(file_name);
    fs::write(&path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(path)
}

#[derive(Debug, Clone)]
pub struct PlaceholderTtsRenderer {
    output_dir: PathBuf,
}

impl PlaceholderTtsRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Capability for PlaceholderTtsRenderer {
    type Input = TtsRenderInput;
    type Output = TtsRenderOutput;

    fn name(&self) -> &str {
        "tts-renderer"
    }

    async fn execute(&self, input: &TtsRenderInput, context: &PipelineContext) -> Result<TtsRenderOutput> {
        ensure_valid(StageName::TtsRender, self.validate(input), "script has no transcript")?;
        info!(voice = ?input.voice, speed = ?input.speed, "Rendering TTS");

        let audio_path = write_placeholder(
            self.output_dir.join("audio"),
            format!("{}.mp3", context.id),
            b"fake audio data",
        )
        .await?;

        info!(path = %audio_path.display(), "TTS rendered");
        Ok(TtsRenderOutput {
            audio_path,
            duration: PLACEHOLDER_DURATION,
        })
    }

    fn validate(&self, input: &TtsRenderInput) -> bool {
        !input.script.transcript.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PlaceholderVideoAssembler {
    output_dir: PathBuf,
}

impl PlaceholderVideoAssembler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Capability for PlaceholderVideoAssembler {
    type Input = VideoAssembleInput;
    type Output = VideoAssembleOutput;

    fn name(&self) -> &str {
        "video-assembler"
    }

    async fn execute(&self, input: &VideoAssembleInput, context: &PipelineContext) -> Result<VideoAssembleOutput> {
        ensure_valid(StageName::VideoAssemble, self.validate(input), "audio path is empty")?;
        info!(
            audio = %input.audio_path.display(),
            background = ?input.background_video,
            "Assembling video"
        );

        let video_path = write_placeholder(
            self.output_dir.join("renders"),
            format!("{}.mp4", context.id),
            b"fake video data",
        )
        .await?;

        info!(path = %video_path.display(), "Video assembled");
        Ok(VideoAssembleOutput {
            video_path,
            duration: PLACEHOLDER_DURATION,
        })
    }

    fn validate(&self, input: &VideoAssembleInput) -> bool {
        !is_blank(&input.audio_path)
    }
}

#[derive(Debug, Clone)]
pub struct PlaceholderThumbnailMaker {
    output_dir: PathBuf,
}

impl PlaceholderThumbnailMaker {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Capability for PlaceholderThumbnailMaker {
    type Input = ThumbnailMakeInput;
    type Output = ThumbnailMakeOutput;

    fn name(&self) -> &str {
        "thumbnail-maker"
    }

    async fn execute(&self, input: &ThumbnailMakeInput, context: &PipelineContext) -> Result<ThumbnailMakeOutput> {
        ensure_valid(StageName::ThumbnailMake, self.validate(input), "script has no title")?;
        info!(title = %input.script.title, "Creating thumbnail");

        let thumbnail_path = write_placeholder(
            self.output_dir.join("thumbs"),
            format!("{}.jpg", context.id),
            b"fake thumbnail data",
        )
        .await?;

        info!(path = %thumbnail_path.display(), "Thumbnail created");
        Ok(ThumbnailMakeOutput { thumbnail_path })
    }

    fn validate(&self, input: &ThumbnailMakeInput) -> bool {
        !input.script.title.is_empty()
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Script, VideoFormat};
    use tempfile::TempDir;

    fn script() -> Script {
        Script {
            title: "Rust".to_string(),
            description: "About Rust".to_string(),
            transcript: "Rust is a systems language.".to_string(),
            segments: vec![],
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_tts_writes_audio_named_after_run() {
        let temp = TempDir::new().unwrap();
        let context = PipelineContext::new("Rust", VideoFormat::Short).unwrap();
        let renderer = PlaceholderTtsRenderer::new(temp.path());

        let input = TtsRenderInput {
            script: script(),
            voice: Some("alloy".to_string()),
            speed: None,
        };
        let output = renderer.execute(&input, &context).await.unwrap();

        assert_eq!(output.audio_path, temp.path().join("audio").join(format!("{}.mp3", context.id)));
        assert!(output.audio_path.exists());
        assert_eq!(output.duration, 60.0);
    }

    #[tokio::test]
    async fn test_video_assembler_rejects_missing_audio() {
        let temp = TempDir::new().unwrap();
        let context = PipelineContext::new("Rust", VideoFormat::Short).unwrap();
        let assembler = PlaceholderVideoAssembler::new(temp.path());

        let input = VideoAssembleInput {
            script: script(),
            audio_path: PathBuf::new(),
            background_video: None,
        };

        assert!(!assembler.validate(&input));
        assert!(assembler.execute(&input, &context).await.is_err());
        assert!(!temp.path().join("renders").exists());
    }
}
