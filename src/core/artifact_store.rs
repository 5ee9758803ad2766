//! Per-run storage of stage outputs.
//!
//! Each completed stage's output is written as JSON to
//! `<data_dir>/artifacts/<id>/<stage>.json`, so a resumed run can feed
//! downstream stages without re-executing the ones that already succeeded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::domain::{validate_pipeline_id, StageName};

use super::state_store::write_atomically;

/// File-based artifact store shared by all runs
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    /// Root directory containing one subdirectory per run
    artifacts_dir: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) the store under `<data_dir>/artifacts`
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let artifacts_dir = data_dir.join("artifacts");
        fs::create_dir_all(&artifacts_dir)
            .await
            .with_context(|| format!("Failed to create artifacts directory: {}", artifacts_dir.display()))?;

        Ok(Self { artifacts_dir })
    }

    /// Directory holding the artifacts of one run
    pub fn run_dir(&self, id: &str) -> Result<PathBuf> {
        validate_pipeline_id(id).map_err(anyhow::Error::msg)?;
        Ok(self.artifacts_dir.join(id))
    }

    fn artifact_path(&self, id: &str, stage: StageName) -> Result<PathBuf> {
        Ok(self.run_dir(id)?.join(format!("{}.json", stage.as_str())))
    }

    /// Store a stage output
    pub async fn save<T: Serialize>(&self, id: &str, stage: StageName, output: &T) -> Result<PathBuf> {
        let run_dir = self.run_dir(id)?;
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create artifact directory: {}", run_dir.display()))?;

        let artifact_path = self.artifact_path(id, stage)?;
        let json = serde_json::to_vec_pretty(output).context("Failed to serialize artifact")?;

        // Replaced by rename, so a crash never leaves a truncated artifact
        let target = artifact_path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&run_dir, &target, &json))
            .await
            .context("Artifact write task failed")?
            .with_context(|| format!("Failed to write artifact: {}", artifact_path.display()))?;

        Ok(artifact_path)
    }

    /// Load a stage output, `None` if it was never stored or no longer decodes
    pub async fn load<T: DeserializeOwned>(&self, id: &str, stage: StageName) -> Result<Option<T>> {
        let artifact_path = self.artifact_path(id, stage)?;

        if !artifact_path.exists() {
            return Ok(None);
        }

        let content = fs::read(&artifact_path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", artifact_path.display()))?;

        match serde_json::from_slice(&content) {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                tracing::warn!(
                    path = %artifact_path.display(),
                    error = %e,
                    "Unreadable artifact, ignoring"
                );
                Ok(None)
            }
        }
    }

    /// Stages that have a stored artifact for this run, in execution order
    pub async fn list(&self, id: &str) -> Result<Vec<StageName>> {
        let run_dir = self.run_dir(id)?;
        let mut stages: Vec<StageName> = Vec::new();

        if !run_dir.exists() {
            return Ok(stages);
        }

        let mut entries = fs::read_dir(&run_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stage) = name.strip_suffix(".json").and_then(|n| n.parse::<StageName>().ok()) {
                    stages.push(stage);
                }
            }
        }

        stages.sort();
        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Keyword, KeywordFetchOutput};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_artifact_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path()).await.unwrap();

        let output = KeywordFetchOutput {
            keywords: vec![Keyword {
                keyword: "rust".to_string(),
                search_volume: Some(1000),
                competition: None,
                cpc: None,
            }],
        };

        store.save("run-1", StageName::KeywordFetch, &output).await.unwrap();

        let loaded: Option<KeywordFetchOutput> =
            store.load("run-1", StageName::KeywordFetch).await.unwrap();
        assert_eq!(loaded, Some(output));

        let missing: Option<KeywordFetchOutput> =
            store.load("run-1", StageName::ScriptGenerate).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_list_artifacts_in_stage_order() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path()).await.unwrap();

        store.save("run-2", StageName::TtsRender, &"audio").await.unwrap();
        store.save("run-2", StageName::KeywordFetch, &"keywords").await.unwrap();

        let stages = store.list("run-2").await.unwrap();
        assert_eq!(stages, vec![StageName::KeywordFetch, StageName::TtsRender]);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_whole_file() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path()).await.unwrap();

        let long = "x".repeat(4096);
        store.save("run-3", StageName::Upload, &long).await.unwrap();
        store.save("run-3", StageName::Upload, &"short").await.unwrap();

        let loaded: Option<String> = store.load("run-3", StageName::Upload).await.unwrap();
        assert_eq!(loaded.as_deref(), Some("short"));

        // No temporary files are left next to the artifact
        let entries: Vec<_> = std::fs::read_dir(store.run_dir("run-3").unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("upload.json")]);
    }
}
