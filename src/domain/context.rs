//! Identity and parameters of one pipeline run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Target video length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Short,
    Long,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self::Short
    }
}

impl VideoFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => Ok(Self::Short),
            "long" => Ok(Self::Long),
            other => Err(format!(
                "invalid format '{}': must be \"short\" or \"long\"",
                other
            )),
        }
    }
}

/// Immutable identity of a run.
///
/// Created once by whoever submits the run (CLI, queue producer) and never
/// reassigned; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    /// Globally unique run id, also the state file name
    pub id: String,

    /// Subject of the video (non-empty)
    pub topic: String,

    pub format: VideoFormat,

    pub created_at: DateTime<Utc>,
}

impl PipelineContext {
    /// Create a context with a freshly generated id
    /// (`YYYY-MM-DD_<topic-slug>_<6 chars>`).
    pub fn new(topic: impl Into<String>, format: VideoFormat) -> Result<Self, String> {
        let topic = topic.into();
        let created_at = Utc::now();
        let id = generate_pipeline_id(&topic, created_at);
        Self::with_id(id, topic, format, created_at)
    }

    /// Create a context with a caller-chosen id
    pub fn with_id(
        id: impl Into<String>,
        topic: impl Into<String>,
        format: VideoFormat,
        created_at: DateTime<Utc>,
    ) -> Result<Self, String> {
        let context = Self {
            id: id.into(),
            topic: topic.into(),
            format,
            created_at,
        };
        context.validate()?;
        Ok(context)
    }

    /// Check the invariants a context must hold before it is executed
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("topic cannot be empty".to_string());
        }
        validate_pipeline_id(&self.id)
    }
}

/// Pipeline ids double as file names, so they must be a single path component.
pub fn validate_pipeline_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id == "." || id == ".." {
        return Err(format!("invalid pipeline id '{}'", id));
    }
    if id.contains(['/', '\\', '\0']) {
        return Err(format!(
            "invalid pipeline id '{}': must not contain path separators",
            id
        ));
    }
    Ok(())
}

fn generate_pipeline_id(topic: &str, created_at: DateTime<Utc>) -> String {
    let slug: String = topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .take(48)
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();

    format!(
        "{}_{}_{}",
        created_at.format("%Y-%m-%d"),
        slug,
        &suffix[..6]
    )
}
