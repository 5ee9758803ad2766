//! Typed inputs and outputs exchanged between stages.
//!
//! Every stage's input is built from the run context plus outputs of
//! earlier stages; every output is persisted as a JSON artifact.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::VideoFormat;

/// A search keyword with optional market data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyword {
    pub keyword: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_volume: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpc: Option<f64>,
}

/// A timed piece of the narration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub text: String,

    /// Offset from the start of the video, in seconds
    pub timestamp: f64,
}

/// Generated video script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub description: String,
    pub transcript: String,
    pub segments: Vec<ScriptSegment>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordFetchInput {
    pub topic: String,
    pub format: VideoFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordFetchOutput {
    pub keywords: Vec<Keyword>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptGenerateInput {
    pub topic: String,
    pub keywords: Vec<Keyword>,
    pub format: VideoFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptGenerateOutput {
    pub script: Script,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsRenderInput {
    pub script: Script,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsRenderOutput {
    pub audio_path: PathBuf,

    /// Audio length in seconds
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAssembleInput {
    pub script: Script,
    pub audio_path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_video: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAssembleOutput {
    pub video_path: PathBuf,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailMakeInput {
    pub script: Script,
    pub video_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailMakeOutput {
    pub thumbnail_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataBuildInput {
    pub script: Script,
    pub video_path: PathBuf,
    pub thumbnail_path: PathBuf,
}

/// Visibility of the uploaded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    Private,
    Public,
    Unlisted,
}

impl Default for PrivacyStatus {
    fn default() -> Self {
        Self::Private
    }
}

impl fmt::Display for PrivacyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::Unlisted => "unlisted",
        };
        f.write_str(s)
    }
}

/// Output of the metadata stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,

    pub privacy_status: PrivacyStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInput {
    pub video_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub metadata: VideoMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutput {
    pub video_id: String,
    pub url: String,
    pub upload_date: DateTime<Utc>,
}

/// One title/description candidate in an A/B test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbTestInput {
    pub video_id: String,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbTestOutput {
    pub test_id: String,
    pub variant_ids: Vec<String>,
}
