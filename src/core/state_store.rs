//! Durable, file-per-run pipeline state.
//!
//! Each run's `PipelineState` lives in `<data_dir>/state/<id>.json` and is
//! rewritten in full after every mutation. Records for different ids never
//! share a file, so concurrent runs do not contend; a single engine drives
//! a given id at a time, so read-merge-write needs no lock.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::{
    validate_pipeline_id, PipelineContext, PipelineState, StageName, StageState, StageStatus,
    StageStatusPatch,
};

/// Errors that can occur in the state store
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("No state found for pipeline {0}")]
    NoSuchPipeline(String),

    #[error("Invalid transition for stage '{stage}' of pipeline {pipeline_id}: {from} → {to}")]
    InvalidTransition {
        pipeline_id: String,
        stage: StageName,
        from: StageState,
        to: StageState,
    },

    #[error("{0}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// File-backed store of pipeline states keyed by pipeline id
#[derive(Debug, Clone)]
pub struct StateStore {
    /// Directory containing one `<id>.json` per run
    state_dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the store under `<data_dir>/state`
    pub async fn open(data_dir: &Path) -> Result<Self, StateStoreError> {
        let state_dir = data_dir.join("state");
        fs::create_dir_all(&state_dir).await?;
        Ok(Self { state_dir })
    }

    /// Directory holding the state records
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self, id: &str) -> Result<PathBuf, StateStoreError> {
        validate_pipeline_id(id).map_err(StateStoreError::InvalidId)?;
        Ok(self.state_dir.join(format!("{}.json", id)))
    }

    /// Load the state for `id`.
    ///
    /// Returns `None` when no record exists, or when the record cannot be
    /// decoded (logged as corrupt and treated as absent).
    pub async fn load(&self, id: &str) -> Result<Option<PipelineState>, StateStoreError> {
        let path = self.state_path(id)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(decode_record(&path, id, &bytes))
    }

    /// Initialize an empty-steps state for a run and persist it.
    ///
    /// Overwrites any existing record for the same id.
    pub async fn create(&self, context: &PipelineContext) -> Result<PipelineState, StateStoreError> {
        let state = PipelineState::new(context.clone());
        self.save(&state).await?;
        debug!(pipeline_id = %context.id, "Created pipeline state");
        Ok(state)
    }

    /// Merge `patch` into the record for `stage` and persist the whole state.
    ///
    /// An untouched stage starts from a `pending` record. Patches that would
    /// move a stage backwards (e.g. `completed -> running`) are rejected.
    pub async fn update_stage_status(
        &self,
        id: &str,
        stage: StageName,
        patch: &StageStatusPatch,
    ) -> Result<PipelineState, StateStoreError> {
        let mut state = self
            .load(id)
            .await?
            .ok_or_else(|| StateStoreError::NoSuchPipeline(id.to_string()))?;

        let record = state.steps.entry(stage.as_str().to_string()).or_default();

        if let Some(next) = patch.status {
            if !record.status.can_transition_to(next) {
                return Err(StateStoreError::InvalidTransition {
                    pipeline_id: id.to_string(),
                    stage,
                    from: record.status,
                    to: next,
                });
            }
        }

        record.merge(patch);
        if record.status != StageState::Failed {
            record.error = None;
        }

        self.save(&state).await?;
        Ok(state)
    }

    /// Unconditionally overwrite the record for `state.context.id`.
    ///
    /// The JSON is written to a temporary file in the state directory and
    /// renamed over the final path, so readers see either the old or the new
    /// record.
    pub async fn save(&self, state: &PipelineState) -> Result<(), StateStoreError> {
        let path = self.state_path(state.id())?;
        let json = serde_json::to_vec_pretty(state)?;
        let dir = self.state_dir.clone();

        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &json))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        Ok(())
    }

    /// Status record of one stage, if the run and stage exist
    pub async fn stage_status(
        &self,
        id: &str,
        stage: StageName,
    ) -> Result<Option<StageStatus>, StateStoreError> {
        Ok(self
            .load(id)
            .await?
            .and_then(|state| state.stage(stage).cloned()))
    }

    /// Whether `stage` of run `id` is recorded as completed
    pub async fn is_stage_completed(&self, id: &str, stage: StageName) -> Result<bool, StateStoreError> {
        Ok(self
            .stage_status(id, stage)
            .await?
            .map(|s| s.status == StageState::Completed)
            .unwrap_or(false))
    }

    /// Lazily enumerate every persisted state.
    ///
    /// Each call starts a fresh directory scan. Records that fail to decode
    /// are logged and skipped.
    pub fn list_all(&self) -> impl Stream<Item = PipelineState> + Send + 'static {
        stream::unfold(Listing::Unopened(self.state_dir.clone()), |mut listing| async move {
            loop {
                listing = match listing {
                    Listing::Unopened(dir) => match fs::read_dir(&dir).await {
                        Ok(entries) => Listing::Reading(entries),
                        Err(e) => {
                            if e.kind() != io::ErrorKind::NotFound {
                                warn!(dir = %dir.display(), error = %e, "Failed to read state directory");
                            }
                            return None;
                        }
                    },
                    Listing::Reading(mut entries) => match entries.next_entry().await {
                        Ok(Some(entry)) => {
                            if let Some(state) = read_record(&entry.path()).await {
                                return Some((state, Listing::Reading(entries)));
                            }
                            Listing::Reading(entries)
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            warn!(error = %e, "Failed to enumerate state directory");
                            return None;
                        }
                    },
                };
            }
        })
    }

    /// Collect every persisted state, newest first
    pub async fn collect_all(&self) -> Vec<PipelineState> {
        let mut states: Vec<PipelineState> = self.list_all().collect().await;
        states.sort_by(|a, b| b.context.created_at.cmp(&a.context.created_at));
        states
    }
}

enum Listing {
    Unopened(PathBuf),
    Reading(fs::ReadDir),
}

/// Read one directory entry as a state record; `None` for anything that
/// is not a decodable `<id>.json` file.
async fn read_record(path: &Path) -> Option<PipelineState> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let id = path.file_stem()?.to_str()?;

    match fs::read(path).await {
        Ok(bytes) => decode_record(path, id, &bytes),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read state record");
            None
        }
    }
}

fn decode_record(path: &Path, id: &str, bytes: &[u8]) -> Option<PipelineState> {
    match serde_json::from_slice::<PipelineState>(bytes) {
        Ok(state) if state.context.id == id => Some(state),
        Ok(state) => {
            warn!(
                path = %path.display(),
                recorded_id = %state.context.id,
                "Corrupt pipeline state: id does not match file name, treating as absent"
            );
            None
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Corrupt pipeline state, treating as absent"
            );
            None
        }
    }
}

/// Write `contents` to a temporary file in `dir` and rename it over `path`
pub(crate) fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VideoFormat;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn create_test_store() -> (StateStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).await.unwrap();
        (store, temp)
    }

    fn test_context() -> PipelineContext {
        PipelineContext::new("state store", VideoFormat::Short).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let (store, _temp) = create_test_store().await;
        let context = test_context();

        let created = store.create(&context).await.unwrap();
        let loaded = store.load(&context.id).await.unwrap().unwrap();

        assert_eq!(created, loaded);
        assert!(loaded.steps.is_empty());
        assert!(store.state_dir().join(format!("{}.json", context.id)).exists());
    }

    #[tokio::test]
    async fn test_update_defaults_untouched_stage_to_pending() {
        let (store, _temp) = create_test_store().await;
        let context = test_context();
        store.create(&context).await.unwrap();

        let patch = StageStatusPatch {
            retry_count: Some(0),
            ..Default::default()
        };
        let state = store
            .update_stage_status(&context.id, StageName::KeywordFetch, &patch)
            .await
            .unwrap();

        let record = state.stage(StageName::KeywordFetch).unwrap();
        assert_eq!(record.status, StageState::Pending);
        assert_eq!(record.retry_count, Some(0));
    }

    #[tokio::test]
    async fn test_regression_rejected() {
        let (store, _temp) = create_test_store().await;
        let context = test_context();
        store.create(&context).await.unwrap();

        let stage = StageName::ScriptGenerate;
        store
            .update_stage_status(&context.id, stage, &StageStatusPatch::running(Utc::now()))
            .await
            .unwrap();
        store
            .update_stage_status(&context.id, stage, &StageStatusPatch::completed(Utc::now(), 0))
            .await
            .unwrap();

        let result = store
            .update_stage_status(&context.id, stage, &StageStatusPatch::running(Utc::now()))
            .await;

        assert!(matches!(
            result,
            Err(StateStoreError::InvalidTransition {
                from: StageState::Completed,
                to: StageState::Running,
                ..
            })
        ));
        assert!(store.is_stage_completed(&context.id, stage).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatched_id_is_corrupt() {
        let (store, _temp) = create_test_store().await;
        let context = test_context();
        let state = PipelineState::new(context);

        let json = serde_json::to_vec(&state).unwrap();
        std::fs::write(store.state_dir().join("other-id.json"), json).unwrap();

        assert!(store.load("other-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let (store, _temp) = create_test_store().await;
        assert!(matches!(
            store.load("../outside").await,
            Err(StateStoreError::InvalidId(_))
        ));
    }
}
