//! Event Bus Integration Tests
//!
//! Topic routing, acknowledgement and broker availability through the
//! in-process broker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use faceless::core::{
    topic_matches, BrokerStats, EventBus, EventBusError, EventHandler, EventPublisher, MemoryBroker,
};
use faceless::domain::EventEnvelope;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Forwards every handled topic; rejects payloads flagged with `"reject": true`
struct Forwarder {
    tx: mpsc::UnboundedSender<(String, serde_json::Value)>,
}

#[async_trait]
impl EventHandler for Forwarder {
    async fn handle(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let reject = payload["reject"].as_bool().unwrap_or(false);
        self.tx.send((topic.to_string(), payload)).ok();
        if reject {
            bail!("rejected by handler");
        }
        Ok(())
    }
}

fn forwarder() -> (Arc<Forwarder>, mpsc::UnboundedReceiver<(String, serde_json::Value)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Forwarder { tx }), rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(String, serde_json::Value)>) -> (String, serde_json::Value) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("handler channel closed")
}

/// Poll broker counters until `done` holds
async fn wait_for_stats(broker: &MemoryBroker, done: impl Fn(&BrokerStats) -> bool) -> BrokerStats {
    for _ in 0..200 {
        let stats = broker.stats();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    broker.stats()
}

#[tokio::test]
async fn test_wildcard_routing() {
    let broker = MemoryBroker::new();
    let bus = EventBus::new(Arc::new(broker.clone()), "faceless-pipeline");
    bus.connect().await.unwrap();

    let (all, mut all_rx) = forwarder();
    let (completed, mut completed_rx) = forwarder();
    let _all = bus.subscribe("pipeline.#", all).await.unwrap();
    let _completed = bus.subscribe("pipeline.*.completed", completed).await.unwrap();

    bus.publish("pipeline.upload.started", json!({ "pipelineId": "p1" }))
        .await
        .unwrap();
    bus.publish("pipeline.upload.completed", json!({ "pipelineId": "p1" }))
        .await
        .unwrap();
    bus.publish("pipeline.completed", json!({ "pipelineId": "p1" }))
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next(&mut all_rx).await.0);
    }
    assert_eq!(
        seen,
        vec!["pipeline.upload.started", "pipeline.upload.completed", "pipeline.completed"]
    );

    let (topic, payload) = next(&mut completed_rx).await;
    assert_eq!(topic, "pipeline.upload.completed");
    assert_eq!(payload["pipelineId"], "p1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(completed_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_handler_outcome_settles_delivery() {
    let broker = MemoryBroker::new();
    let bus = EventBus::new(Arc::new(broker.clone()), "faceless-pipeline");
    bus.connect().await.unwrap();

    let (handler, mut rx) = forwarder();
    let _sub = bus.subscribe("pipeline.#", handler).await.unwrap();

    bus.publish("pipeline.keywordFetch.started", json!({ "pipelineId": "p2" }))
        .await
        .unwrap();
    bus.publish("pipeline.keywordFetch.failed", json!({ "pipelineId": "p2", "reject": true }))
        .await
        .unwrap();

    next(&mut rx).await;
    next(&mut rx).await;

    let stats = wait_for_stats(&broker, |s| s.acked + s.dead_lettered == 2).await;
    assert_eq!(stats.published, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.requeued, 0);
}

#[tokio::test]
async fn test_unrouted_publish_succeeds() {
    let broker = MemoryBroker::new();
    let bus = EventBus::new(Arc::new(broker.clone()), "faceless-pipeline");
    bus.connect().await.unwrap();

    bus.publish("pipeline.queued", json!({ "pipelineId": "p3" }))
        .await
        .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.unroutable, 1);
}

#[tokio::test]
async fn test_unreachable_broker() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);

    let bus = EventBus::new(Arc::new(broker.clone()), "faceless-pipeline");
    assert!(matches!(bus.connect().await, Err(EventBusError::Connect(_))));
    assert!(!bus.is_connected());

    // Broker drops after a successful connect
    broker.set_reachable(true);
    bus.connect().await.unwrap();
    broker.set_reachable(false);

    let result = bus.publish("pipeline.upload.started", json!({})).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_journal_records_envelopes() {
    let temp = TempDir::new().unwrap();
    let broker = MemoryBroker::with_journal(temp.path().join("events"));
    let bus = EventBus::new(Arc::new(broker.clone()), "faceless-pipeline");
    bus.connect().await.unwrap();

    bus.publish("pipeline.upload.completed", json!({ "pipelineId": "p4", "retryCount": 0 }))
        .await
        .unwrap();

    let journal = broker.journal_path("faceless-pipeline").unwrap();
    let content = tokio::fs::read_to_string(journal).await.unwrap();
    let envelopes: Vec<EventEnvelope> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].event, "pipeline.upload.completed");
    assert_eq!(envelopes[0].pipeline_id(), Some("p4"));
}

#[test]
fn test_topic_patterns() {
    assert!(topic_matches("pipeline.*.failed", "pipeline.ttsRender.failed"));
    assert!(!topic_matches("pipeline.*.failed", "pipeline.failed"));
    assert!(topic_matches("pipeline.#.failed", "pipeline.failed"));
}
