//! Topic-routed lifecycle notifications.
//!
//! The engine only depends on the [`EventPublisher`] seam. `EventBus` is the
//! broker-backed implementation; `NoopPublisher` and `RecordingPublisher`
//! stand in when no broker is wanted (tests, one-off CLI runs).
//!
//! Publishing is a side channel: the engine logs publish failures and keeps
//! going, it never aborts a run because a notification was lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::EventEnvelope;

use super::broker::{Broker, BrokerChannel};

/// Errors that can occur on the event bus
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Channel not initialized. Call connect() first.")]
    NotConnected,

    #[error("Failed to connect to message broker: {0}")]
    Connect(String),

    #[error("Failed to publish event '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to '{pattern}': {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Publishing seam used by the engine and the worker
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `payload` under the dot-delimited `topic`
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), EventBusError>;
}

/// Consumer callback for [`EventBus::subscribe`].
///
/// Returning an error rejects the message without requeueing it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// Broker-backed publish/subscribe bus scoped to one topic exchange
pub struct EventBus {
    broker: Arc<dyn Broker>,
    exchange: String,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            channel: RwLock::new(None),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_connected(&self) -> bool {
        self.channel.read().is_some()
    }

    /// Open a channel and declare the durable topic exchange
    pub async fn connect(&self) -> Result<(), EventBusError> {
        let channel = self.broker.connect().await.map_err(|e| {
            error!(error = %e, "Failed to connect to message broker");
            e
        })?;

        channel.declare_topic_exchange(&self.exchange, true).await?;
        *self.channel.write() = Some(channel);

        info!(exchange = %self.exchange, "Connected to message broker");
        Ok(())
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>, EventBusError> {
        self.channel.read().clone().ok_or(EventBusError::NotConnected)
    }

    /// Bind an exclusive queue with `pattern` and feed matching payloads to
    /// `handler`. Successful handling acks the message; a handler error (or
    /// an undecodable body) nacks it without requeue.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, EventBusError> {
        let channel = self.channel()?;
        let mut deliveries = channel.consume(&self.exchange, pattern).await.map_err(|e| {
            error!(error = %e, pattern, "Failed to subscribe");
            e
        })?;

        let task_pattern = pattern.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let outcome = match serde_json::from_slice::<EventEnvelope>(&delivery.body) {
                    Ok(envelope) => handler.handle(&delivery.routing_key, envelope.data).await,
                    Err(e) => Err(anyhow::Error::new(e).context("Undecodable event body")),
                };

                let settled = match outcome {
                    Ok(()) => channel.ack(delivery.delivery_tag).await,
                    Err(e) => {
                        error!(
                            pattern = %task_pattern,
                            topic = %delivery.routing_key,
                            error = %format!("{:#}", e),
                            "Failed to process message"
                        );
                        channel.nack(delivery.delivery_tag, false).await
                    }
                };

                if let Err(e) = settled {
                    warn!(error = %e, "Failed to settle delivery");
                }
            }
        });

        info!(pattern, "Subscribed to events");
        Ok(Subscription {
            pattern: pattern.to_string(),
            task,
        })
    }

    /// Release the channel. Errors are logged, not returned.
    pub async fn disconnect(&self) {
        let channel = self.channel.write().take();

        if let Some(channel) = channel {
            match channel.close().await {
                Ok(()) => info!("Disconnected from message broker"),
                Err(e) => error!(error = %e, "Error during disconnect"),
            }
        }
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), EventBusError> {
        let channel = self.channel()?;
        let envelope = EventEnvelope::new(topic, payload);
        let body = serde_json::to_vec(&envelope)?;

        channel
            .publish(&self.exchange, topic, body, true)
            .await
            .map_err(|e| {
                error!(error = %e, event = topic, "Failed to publish event");
                e
            })?;

        debug!(event = topic, "Event published");
        Ok(())
    }
}

/// Handle to a running subscription; consumption stops when it is dropped
pub struct Subscription {
    pattern: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Stop consuming
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Publisher that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _topic: &str, _payload: serde_json::Value) -> Result<(), EventBusError> {
        Ok(())
    }
}

/// In-memory publisher that keeps every event, in emission order
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<EventEnvelope>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (events are not recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), EventBusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventBusError::Publish {
                topic: topic.to_string(),
                reason: "publisher configured to fail".to_string(),
            });
        }

        self.events.lock().push(EventEnvelope::new(topic, payload));
        Ok(())
    }
}
