//! Per-stage status records and the durable pipeline state aggregate.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::PipelineContext;
use super::stage::StageName;

/// Execution state of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed after exhausting retries
    Failed,
}

impl Default for StageState {
    fn default() -> Self {
        Self::Pending
    }
}

impl StageState {
    /// `completed` and `failed` admit no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects
    /// `pending -> running -> {completed | failed}`.
    ///
    /// Re-applying the current state is allowed so field-only patches merge.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending)
                | (Self::Pending, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Completed, Self::Completed)
                | (Self::Failed, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted execution record of one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub status: StageState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Present only when `status` is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Failed attempts before the terminal outcome (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl StageStatus {
    /// Merge the fields present in `patch` into this record
    pub fn merge(&mut self, patch: &StageStatusPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(ref error) = patch.error {
            self.error = Some(error.clone());
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = Some(retry_count);
        }
    }
}

/// Partial stage record applied by `StateStore::update_stage_status`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStatusPatch {
    pub status: Option<StageState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
}

impl StageStatusPatch {
    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(StageState::Running),
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    pub fn completed(completed_at: DateTime<Utc>, retry_count: u32) -> Self {
        Self {
            status: Some(StageState::Completed),
            completed_at: Some(completed_at),
            retry_count: Some(retry_count),
            ..Default::default()
        }
    }

    pub fn failed(completed_at: DateTime<Utc>, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            status: Some(StageState::Failed),
            completed_at: Some(completed_at),
            error: Some(error.into()),
            retry_count: Some(retry_count),
            ..Default::default()
        }
    }
}

/// The durable aggregate: one per pipeline id.
///
/// Persisted as `{ "context": {...}, "steps": { "<stage>": {...} } }`.
/// `steps` is populated lazily as stages are first touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub context: PipelineContext,

    #[serde(default)]
    pub steps: HashMap<String, StageStatus>,
}

impl PipelineState {
    /// Fresh state with no stage touched yet
    pub fn new(context: PipelineContext) -> Self {
        Self {
            context,
            steps: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.context.id
    }

    /// Status of a stage, if it has been touched
    pub fn stage(&self, stage: StageName) -> Option<&StageStatus> {
        self.steps.get(stage.as_str())
    }

    /// Current state of a stage (`pending` if untouched)
    pub fn stage_state(&self, stage: StageName) -> StageState {
        self.stage(stage).map(|s| s.status).unwrap_or_default()
    }

    pub fn is_stage_completed(&self, stage: StageName) -> bool {
        self.stage_state(stage) == StageState::Completed
    }

    /// All eight stages completed
    pub fn is_complete(&self) -> bool {
        StageName::ALL.iter().all(|s| self.is_stage_completed(*s))
    }

    /// First stage (in execution order) that failed, with its error
    pub fn failed_stage(&self) -> Option<(StageName, Option<&str>)> {
        StageName::ALL.iter().find_map(|s| {
            self.stage(*s)
                .filter(|status| status.status == StageState::Failed)
                .map(|status| (*s, status.error.as_deref()))
        })
    }

    /// Coarse run-level summary derived from the step records
    pub fn summary(&self) -> RunSummary {
        if self.failed_stage().is_some() {
            RunSummary::Failed
        } else if self.is_complete() {
            RunSummary::Completed
        } else if self.steps.values().any(|s| s.status == StageState::Running) {
            RunSummary::Running
        } else if self.steps.is_empty() {
            RunSummary::Pending
        } else {
            RunSummary::Partial
        }
    }
}

/// Derived run-level view (the run itself has no persisted terminal state)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSummary {
    Pending,
    Running,
    Partial,
    Completed,
    Failed,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VideoFormat;

    fn test_state() -> PipelineState {
        let context = PipelineContext::new("testing", VideoFormat::Short).unwrap();
        PipelineState::new(context)
    }

    #[test]
    fn test_transitions() {
        assert!(StageState::Pending.can_transition_to(StageState::Running));
        assert!(StageState::Running.can_transition_to(StageState::Completed));
        assert!(StageState::Running.can_transition_to(StageState::Failed));

        assert!(!StageState::Pending.can_transition_to(StageState::Completed));
        assert!(!StageState::Completed.can_transition_to(StageState::Running));
        assert!(!StageState::Failed.can_transition_to(StageState::Running));
        assert!(!StageState::Completed.can_transition_to(StageState::Failed));
    }

    #[test]
    fn test_merge_keeps_unpatched_fields() {
        let started = Utc::now();
        let mut status = StageStatus::default();
        status.merge(&StageStatusPatch::running(started));
        status.merge(&StageStatusPatch::completed(Utc::now(), 1));

        assert_eq!(status.status, StageState::Completed);
        assert_eq!(status.started_at, Some(started));
        assert!(status.completed_at.is_some());
        assert_eq!(status.retry_count, Some(1));
        assert!(status.error.is_none());
    }

    #[test]
    fn test_summary() {
        let mut state = test_state();
        assert_eq!(state.summary(), RunSummary::Pending);

        state.steps.insert(
            StageName::KeywordFetch.as_str().to_string(),
            StageStatus {
                status: StageState::Running,
                ..Default::default()
            },
        );
        assert_eq!(state.summary(), RunSummary::Running);

        state.steps.insert(
            StageName::KeywordFetch.as_str().to_string(),
            StageStatus {
                status: StageState::Failed,
                error: Some("boom".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(state.summary(), RunSummary::Failed);
        assert_eq!(
            state.failed_stage(),
            Some((StageName::KeywordFetch, Some("boom")))
        );
    }

    #[test]
    fn test_absent_optionals_not_serialized() {
        let status = StageStatus::default();
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json, serde_json::json!({ "status": "pending" }));
    }
}
