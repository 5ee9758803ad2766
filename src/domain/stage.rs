//! The fixed stage sequence of a pipeline run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One unit of work in the fixed production sequence.
///
/// The serialized form (camelCase) is used both as the key in a run's
/// persisted `steps` map and as the middle segment of event topics
/// (`pipeline.<stage>.started`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    KeywordFetch,
    ScriptGenerate,
    TtsRender,
    VideoAssemble,
    ThumbnailMake,
    MetadataBuild,
    Upload,
    AbTest,
}

impl StageName {
    /// All stages in execution order
    pub const ALL: [StageName; 8] = [
        StageName::KeywordFetch,
        StageName::ScriptGenerate,
        StageName::TtsRender,
        StageName::VideoAssemble,
        StageName::ThumbnailMake,
        StageName::MetadataBuild,
        StageName::Upload,
        StageName::AbTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeywordFetch => "keywordFetch",
            Self::ScriptGenerate => "scriptGenerate",
            Self::TtsRender => "ttsRender",
            Self::VideoAssemble => "videoAssemble",
            Self::ThumbnailMake => "thumbnailMake",
            Self::MetadataBuild => "metadataBuild",
            Self::Upload => "upload",
            Self::AbTest => "abTest",
        }
    }

    /// Zero-based position in the execution order
    pub fn position(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or_default()
    }

    /// Topic key for this stage's lifecycle event (`pipeline.<stage>.<phase>`)
    pub fn topic(&self, phase: StagePhase) -> String {
        format!("pipeline.{}.{}", self.as_str(), phase.as_str())
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Lifecycle phase published for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Started,
    Completed,
    Failed,
}

impl StagePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(StageName::ALL[0], StageName::KeywordFetch);
        assert_eq!(StageName::ALL[7], StageName::AbTest);
        assert_eq!(StageName::VideoAssemble.position(), 3);
    }

    #[test]
    fn test_stage_name_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
        assert!("keyword-fetcher".parse::<StageName>().is_err());
    }

    #[test]
    fn test_topic_format() {
        assert_eq!(
            StageName::TtsRender.topic(StagePhase::Started),
            "pipeline.ttsRender.started"
        );
        assert_eq!(
            StageName::AbTest.topic(StagePhase::Failed),
            "pipeline.abTest.failed"
        );
    }
}
