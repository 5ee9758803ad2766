//! Message broker abstraction behind the event bus.
//!
//! The traits mirror the small subset of an AMQP-style broker the bus
//! needs: a connection yields a channel, a channel declares a topic
//! exchange, publishes routed messages, consumes through exclusive
//! anonymous queues and settles deliveries with ack/nack.
//!
//! `MemoryBroker` is the in-process implementation. It applies topic
//! routing (`*` = one word, `#` = zero or more words) and can journal
//! persistent messages to `<journal_dir>/<exchange>.jsonl`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::event_bus::EventBusError;

/// A message handed to a consumer, settled later by tag
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Entry point to a broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a logical channel; fails if the broker is unreachable
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, EventBusError>;
}

/// A logical channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare (idempotently) a topic exchange
    async fn declare_topic_exchange(&self, exchange: &str, durable: bool) -> Result<(), EventBusError>;

    /// Publish `body` routed by `routing_key`
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<(), EventBusError>;

    /// Create an exclusive anonymous queue bound with `pattern` and start
    /// consuming it. The queue lives as long as the channel.
    async fn consume(
        &self,
        exchange: &str,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, EventBusError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), EventBusError>;

    /// Reject a delivery; with `requeue = false` it is dropped
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), EventBusError>;

    async fn close(&self) -> Result<(), EventBusError>;
}

/// Whether a routing key matches a topic binding pattern.
///
/// Runs in `O(pattern words * key words)` whatever the number of `#`s.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();

    // reachable[i]: the pattern words seen so far can consume exactly key[..i]
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for word in pattern.split('.') {
        let mut next = vec![false; key.len() + 1];
        match word {
            "#" => {
                let mut any = false;
                for (i, slot) in next.iter_mut().enumerate() {
                    any |= reachable[i];
                    *slot = any;
                }
            }
            "*" => {
                for i in 0..key.len() {
                    next[i + 1] = reachable[i];
                }
            }
            literal => {
                for i in 0..key.len() {
                    next[i + 1] = reachable[i] && key[i] == literal;
                }
            }
        }
        reachable = next;
    }

    reachable[key.len()]
}

/// Delivery counters, for inspection in tests and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

/// In-process topic broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: AtomicBool,
    next_tag: AtomicU64,
    next_queue: AtomicU64,
    exchanges: Mutex<HashMap<String, Exchange>>,
    unacked: Mutex<HashMap<u64, Unacked>>,
    stats: Mutex<BrokerStats>,
    journal_dir: Option<PathBuf>,
}

#[derive(Default)]
struct Exchange {
    bindings: Vec<Binding>,
}

struct Binding {
    queue_id: u64,
    pattern: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    queue_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    routing_key: String,
    body: Vec<u8>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that appends every persistent message to a JSONL journal
    pub fn with_journal(journal_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(BrokerState {
                journal_dir: Some(journal_dir),
                ..Default::default()
            }),
        }
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.stats.lock().clone()
    }

    /// Path of the journal for `exchange`, if journaling is enabled
    pub fn journal_path(&self, exchange: &str) -> Option<PathBuf> {
        self.inner
            .journal_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.jsonl", exchange)))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, EventBusError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(EventBusError::Connect("broker unreachable".to_string()));
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            open: AtomicBool::new(true),
            queues: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    open: AtomicBool,

    /// Exclusive queues owned by this channel
    queues: Mutex<Vec<(String, u64)>>,
}

impl MemoryChannel {
    fn ensure_usable(&self) -> Result<&BrokerState, EventBusError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(EventBusError::NotConnected);
        }
        let state = &*self.broker.inner;
        if state.unreachable.load(Ordering::SeqCst) {
            return Err(EventBusError::Broker("broker unreachable".to_string()));
        }
        Ok(state)
    }

    async fn journal(&self, exchange: &str, body: &[u8]) -> Result<(), EventBusError> {
        let Some(path) = self.broker.journal_path(exchange) else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| EventBusError::Broker(format!("journal write failed: {}", e));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;

        let mut line = body.to_vec();
        line.push(b'\n');
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        Ok(())
    }

    fn route(state: &BrokerState, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), EventBusError> {
        let mut exchanges = state.exchanges.lock();
        let target = exchanges.get_mut(exchange).ok_or_else(|| EventBusError::Publish {
            topic: routing_key.to_string(),
            reason: format!("exchange '{}' not declared", exchange),
        })?;

        // Queues whose consumer went away are unbound, with their pending deliveries
        target.bindings.retain(|b| !b.sender.is_closed());
        state.unacked.lock().retain(|_, u| !u.sender.is_closed());

        let mut delivered = 0u64;
        for binding in target.bindings.iter().filter(|b| topic_matches(&b.pattern, routing_key)) {
            let tag = state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
            };

            state.unacked.lock().insert(
                tag,
                Unacked {
                    queue_id: binding.queue_id,
                    sender: binding.sender.clone(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                },
            );

            if binding.sender.send(delivery).is_ok() {
                delivered += 1;
            } else {
                state.unacked.lock().remove(&tag);
            }
        }
        drop(exchanges);

        let mut stats = state.stats.lock();
        stats.published += 1;
        stats.delivered += delivered;
        if delivered == 0 {
            stats.unroutable += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topic_exchange(&self, exchange: &str, durable: bool) -> Result<(), EventBusError> {
        let state = self.ensure_usable()?;
        state.exchanges.lock().entry(exchange.to_string()).or_default();
        debug!(exchange, durable, "Declared topic exchange");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<(), EventBusError> {
        self.ensure_usable()?;

        if persistent {
            self.journal(exchange, &body).await?;
        }

        let state = self.ensure_usable()?;
        Self::route(state, exchange, routing_key, &body)
    }

    async fn consume(
        &self,
        exchange: &str,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, EventBusError> {
        let state = self.ensure_usable()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue_id = state.next_queue.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut exchanges = state.exchanges.lock();
            let target = exchanges.get_mut(exchange).ok_or_else(|| EventBusError::Subscribe {
                pattern: pattern.to_string(),
                reason: format!("exchange '{}' not declared", exchange),
            })?;
            target.bindings.push(Binding {
                queue_id,
                pattern: pattern.to_string(),
                sender,
            });
        }

        self.queues.lock().push((exchange.to_string(), queue_id));
        debug!(exchange, pattern, queue_id, "Bound exclusive queue");
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), EventBusError> {
        let state = self.ensure_usable()?;
        state
            .unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or_else(|| EventBusError::Broker(format!("unknown delivery tag {}", delivery_tag)))?;
        state.stats.lock().acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), EventBusError> {
        let state = self.ensure_usable()?;
        let unacked = state
            .unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or_else(|| EventBusError::Broker(format!("unknown delivery tag {}", delivery_tag)))?;

        if requeue {
            let tag = state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: unacked.routing_key.clone(),
                body: unacked.body.clone(),
            };
            let sender = unacked.sender.clone();
            state.unacked.lock().insert(tag, unacked);
            if sender.send(delivery).is_err() {
                state.unacked.lock().remove(&tag);
            }
            state.stats.lock().requeued += 1;
        } else {
            state.stats.lock().dead_lettered += 1;
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), EventBusError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let owned: Vec<(String, u64)> = std::mem::take(&mut *self.queues.lock());
        let mut exchanges = self.broker.inner.exchanges.lock();
        for (exchange, queue_id) in &owned {
            if let Some(target) = exchanges.get_mut(exchange) {
                target.bindings.retain(|b| b.queue_id != *queue_id);
            }
        }
        drop(exchanges);

        // Unsettled deliveries die with their queues
        self.broker
            .inner
            .unacked
            .lock()
            .retain(|_, u| !owned.iter().any(|(_, queue_id)| *queue_id == u.queue_id));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("pipeline.upload.completed", "pipeline.upload.completed"));
        assert!(topic_matches("pipeline.*.completed", "pipeline.upload.completed"));
        assert!(topic_matches("pipeline.#", "pipeline.upload.completed"));
        assert!(topic_matches("pipeline.#", "pipeline.completed"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("pipeline.#.failed", "pipeline.failed"));

        assert!(!topic_matches("pipeline.*", "pipeline.upload.completed"));
        assert!(!topic_matches("pipeline.*.completed", "pipeline.upload.failed"));
        assert!(!topic_matches("pipeline.upload", "pipeline.upload.started"));
    }

    #[test]
    fn test_many_hash_words_match_quickly() {
        let pattern = format!("{}.x", vec!["#"; 40].join("."));
        let miss = vec!["a"; 60].join(".");
        let hit = format!("{}.x", miss);

        assert!(!topic_matches(&pattern, &miss));
        assert!(topic_matches(&pattern, &hit));
        assert!(topic_matches(&pattern, "x"));
        assert!(!topic_matches("#.a.#.b", "a.c.c.c.c.c.c.c.c.c.c.c.c.c.c.c.c.c.c.c.c"));
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connect() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        assert!(matches!(broker.connect().await, Err(EventBusError::Connect(_))));
    }

    #[tokio::test]
    async fn test_routing_and_settlement() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_topic_exchange("test", true).await.unwrap();

        let mut completed = channel.consume("test", "pipeline.*.completed").await.unwrap();
        let mut everything = channel.consume("test", "#").await.unwrap();

        channel
            .publish("test", "pipeline.upload.completed", b"a".to_vec(), false)
            .await
            .unwrap();
        channel
            .publish("test", "pipeline.upload.started", b"b".to_vec(), false)
            .await
            .unwrap();

        let first = completed.recv().await.unwrap();
        assert_eq!(first.routing_key, "pipeline.upload.completed");
        channel.ack(first.delivery_tag).await.unwrap();

        let a = everything.recv().await.unwrap();
        let b = everything.recv().await.unwrap();
        assert_eq!(b.body, b"b".to_vec());
        channel.nack(a.delivery_tag, false).await.unwrap();
        channel.ack(b.delivery_tag).await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_publish() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_topic_exchange("test", true).await.unwrap();
        channel.close().await.unwrap();

        let result = channel.publish("test", "a.b", Vec::new(), false).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_drops_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_topic_exchange("test", true).await.unwrap();

        let _receiver = channel.consume("test", "#").await.unwrap();
        channel.publish("test", "a.b", b"x".to_vec(), false).await.unwrap();
        channel.publish("test", "a.c", b"y".to_vec(), false).await.unwrap();
        assert_eq!(broker.inner.unacked.lock().len(), 2);

        channel.close().await.unwrap();
        assert!(broker.inner.unacked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_consumer_releases_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_topic_exchange("test", true).await.unwrap();

        let receiver = channel.consume("test", "a.*").await.unwrap();
        let mut other = channel.consume("test", "b.*").await.unwrap();
        channel.publish("test", "a.b", b"x".to_vec(), false).await.unwrap();
        channel.publish("test", "b.b", b"y".to_vec(), false).await.unwrap();
        assert_eq!(broker.inner.unacked.lock().len(), 2);

        // An aborted subscription only drops its receiver
        drop(receiver);
        channel.publish("test", "c.c", Vec::new(), false).await.unwrap();

        let pending = other.recv().await.unwrap();
        assert_eq!(broker.inner.unacked.lock().len(), 1);
        channel.ack(pending.delivery_tag).await.unwrap();
        assert!(broker.inner.unacked.lock().is_empty());
    }
}
