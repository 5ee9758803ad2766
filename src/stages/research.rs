//! Keyword research and script writing placeholders.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::domain::{
    Keyword, KeywordFetchInput, KeywordFetchOutput, PipelineContext, Script, ScriptGenerateInput,
    ScriptGenerateOutput, ScriptSegment, StageName,
};

use super::{ensure_valid, Capability};

/// Returns the topic itself as the only keyword
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderKeywordFetcher;

#[async_trait]
impl Capability for PlaceholderKeywordFetcher {
    type Input = KeywordFetchInput;
    type Output = KeywordFetchOutput;

    fn name(&self) -> &str {
        "keyword-fetcher"
    }

    async fn execute(&self, input: &KeywordFetchInput, _context: &PipelineContext) -> Result<KeywordFetchOutput> {
        ensure_valid(StageName::KeywordFetch, self.validate(input), "topic must not be empty")?;
        info!(topic = %input.topic, format = %input.format, "Fetching keywords");

        let keywords = vec![Keyword {
            keyword: input.topic.clone(),
            search_volume: Some(1000),
            competition: Some("low".to_string()),
            cpc: Some(0.5),
        }];

        info!(count = keywords.len(), "Keywords fetched");
        Ok(KeywordFetchOutput { keywords })
    }

    fn validate(&self, input: &KeywordFetchInput) -> bool {
        !input.topic.trim().is_empty()
    }
}

/// Fills a fixed script template with the topic
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderScriptGenerator;

#[async_trait]
impl Capability for PlaceholderScriptGenerator {
    type Input = ScriptGenerateInput;
    type Output = ScriptGenerateOutput;

    fn name(&self) -> &str {
        "script-generator"
    }

    async fn execute(&self, input: &ScriptGenerateInput, _context: &PipelineContext) -> Result<ScriptGenerateOutput> {
        ensure_valid(StageName::ScriptGenerate, self.validate(input), "topic must not be empty")?;
        info!(topic = %input.topic, format = %input.format, "Generating script");

        let topic = &input.topic;
        let mut tags = vec!["education".to_string(), topic.to_lowercase(), "tutorial".to_string()];
        for keyword in &input.keywords {
            let tag = keyword.keyword.to_lowercase();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let script = Script {
            title: topic.clone(),
            description: format!("Learn about {} in this {} video.", topic, input.format),
            transcript: format!(
                "Hello! Today we're talking about {0}. {0} is an important topic that everyone should understand.",
                topic
            ),
            segments: vec![ScriptSegment {
                text: "Introduction".to_string(),
                timestamp: 0.0,
            }],
            tags,
        };

        info!(title = %script.title, "Script generated");
        Ok(ScriptGenerateOutput { script })
    }

    fn validate(&self, input: &ScriptGenerateInput) -> bool {
        !input.topic.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VideoFormat;
    use crate::stages::StageError;

    fn context() -> PipelineContext {
        PipelineContext::new("Rust Ownership", VideoFormat::Short).unwrap()
    }

    #[tokio::test]
    async fn test_script_uses_topic_and_keywords() {
        let input = ScriptGenerateInput {
            topic: "Rust Ownership".to_string(),
            keywords: vec![Keyword {
                keyword: "Borrow Checker".to_string(),
                search_volume: None,
                competition: None,
                cpc: None,
            }],
            format: VideoFormat::Long,
        };

        let output = PlaceholderScriptGenerator.execute(&input, &context()).await.unwrap();

        assert_eq!(output.script.title, "Rust Ownership");
        assert_eq!(output.script.description, "Learn about Rust Ownership in this long video.");
        assert!(output.script.tags.contains(&"rust ownership".to_string()));
        assert!(output.script.tags.contains(&"borrow checker".to_string()));
    }

    #[tokio::test]
    async fn test_blank_topic_is_rejected() {
        let input = KeywordFetchInput {
            topic: "   ".to_string(),
            format: VideoFormat::Short,
        };

        let err = PlaceholderKeywordFetcher.execute(&input, &context()).await.unwrap_err();
        let stage_error = err.downcast_ref::<StageError>().unwrap();
        assert!(matches!(stage_error, StageError::InvalidInput { stage: StageName::KeywordFetch, .. }));
    }
}
