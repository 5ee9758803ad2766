//! Wire format of lifecycle notifications published on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The body of every bus message.
///
/// `event` repeats the routing key so a consumer reading a journal (or a
/// wildcard subscription) knows which fact it is looking at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Routing key the message was published under
    pub event: String,

    /// Event payload (`{ pipelineId, ...fields }`)
    pub data: serde_json::Value,

    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Wrap a payload with its event name and the current time
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Pipeline id carried in the payload, if any
    pub fn pipeline_id(&self) -> Option<&str> {
        self.data.get("pipelineId").and_then(|v| v.as_str())
    }
}

/// Run-level topic published when a job is accepted into the queue
pub const TOPIC_PIPELINE_QUEUED: &str = "pipeline.queued";

/// Run-level topic published by the worker once a job finishes successfully
pub const TOPIC_PIPELINE_COMPLETED: &str = "pipeline.completed";

/// Run-level topic published by the worker when a job attempt fails
pub const TOPIC_PIPELINE_FAILED: &str = "pipeline.failed";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let envelope = EventEnvelope::new(
            "pipeline.upload.completed",
            serde_json::json!({ "pipelineId": "abc", "stage": "upload" }),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event, "pipeline.upload.completed");
        assert_eq!(parsed.pipeline_id(), Some("abc"));
    }
}
