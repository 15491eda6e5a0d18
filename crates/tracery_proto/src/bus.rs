//! Message bus.
//!
//! Two delivery disciplines back the protocol: a work list where each pushed
//! trace request is consumed by exactly one worker, and broadcast channels
//! where every subscriber whose pattern matches sees every message. The
//! in-memory bus implements both on tokio primitives; the contract leaves
//! room for an external broker carrying the same JSON messages.

use crate::message::TraceRequest;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracery_core::{CoreError, CoreResult};
use tracing::warn;

/// One published message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Channel it was published on
    pub channel: String,
    /// JSON payload
    pub payload: Value,
}

/// Protocol transport contract
#[async_trait]
pub trait Bus: Send + Sync {
    /// Push a trace request onto the work list.
    async fn push_work(&self, request: TraceRequest) -> CoreResult<()>;

    /// Take the next trace request, waiting until one is available.
    /// `None` once the work list is closed.
    async fn pop_work(&self) -> CoreResult<Option<TraceRequest>>;

    /// Publish a message on a broadcast channel.
    async fn publish(&self, channel: &str, payload: Value) -> CoreResult<()>;

    /// Subscribe to every channel matching `pattern`. A pattern is either a
    /// literal channel name or a `<prefix>.*` wildcard.
    async fn subscribe(&self, pattern: &str) -> CoreResult<Subscription>;
}

/// Live subscription over matching channels
pub struct Subscription {
    pattern: String,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Next matching message; `None` once the bus is gone.
    ///
    /// A subscriber that fell behind the broadcast backlog loses the dropped
    /// messages; the lag is logged and delivery resumes from the oldest
    /// retained message.
    pub async fn next(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if pattern_matches(&self.pattern, &envelope.channel) => {
                    return Some(envelope);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(pattern = self.pattern.as_str(), missed, "subscription lagged");
                }
            }
        }
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => channel
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == channel,
    }
}

/// In-process bus on tokio channels
pub struct MemoryBus {
    work_tx: mpsc::UnboundedSender<TraceRequest>,
    work_rx: Mutex<mpsc::UnboundedReceiver<TraceRequest>>,
    feed: broadcast::Sender<Envelope>,
}

impl MemoryBus {
    /// Broadcast backlog retained per subscriber
    const FEED_CAPACITY: usize = 4096;

    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (feed, _) = broadcast::channel(Self::FEED_CAPACITY);
        Self {
            work_tx,
            work_rx: Mutex::new(work_rx),
            feed,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn push_work(&self, request: TraceRequest) -> CoreResult<()> {
        self.work_tx.send(request).map_err(|_| CoreError::Closed {
            endpoint: crate::message::WORK_TRACE.to_string(),
        })
    }

    async fn pop_work(&self) -> CoreResult<Option<TraceRequest>> {
        Ok(self.work_rx.lock().await.recv().await)
    }

    async fn publish(&self, channel: &str, payload: Value) -> CoreResult<()> {
        // No subscribers is fine; the message is simply unobserved.
        let _ = self.feed.send(Envelope {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> CoreResult<Subscription> {
        Ok(Subscription {
            pattern: pattern.to_string(),
            receiver: self.feed.subscribe(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracery_core::{FlatTrace, NodeId};

    fn request(id: u64) -> TraceRequest {
        TraceRequest {
            node_id: NodeId::from_raw(id),
            trace: FlatTrace::empty(),
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("trace.*", "trace.finished"));
        assert!(pattern_matches("trace.*", "trace.blocked"));
        assert!(!pattern_matches("trace.*", "tracery"));
        assert!(!pattern_matches("trace.*", "node"));
        assert!(pattern_matches("input", "input"));
        assert!(!pattern_matches("input", "inputs"));
    }

    #[tokio::test]
    async fn test_work_list_is_fifo() {
        let bus = MemoryBus::new();
        bus.push_work(request(1)).await.unwrap();
        bus.push_work(request(2)).await.unwrap();
        assert_eq!(bus.pop_work().await.unwrap().unwrap().node_id, NodeId::from_raw(1));
        assert_eq!(bus.pop_work().await.unwrap().unwrap().node_id, NodeId::from_raw(2));
    }

    #[tokio::test]
    async fn test_subscription_filters_by_pattern() {
        let bus = MemoryBus::new();
        let mut results = bus.subscribe("trace.*").await.unwrap();
        let mut nodes = bus.subscribe("node").await.unwrap();

        bus.publish("node", json!({"id": 1})).await.unwrap();
        bus.publish("trace.finished", json!({"node_id": 1})).await.unwrap();

        let seen = results.next().await.unwrap();
        assert_eq!(seen.channel, "trace.finished");
        let seen = nodes.next().await.unwrap();
        assert_eq!(seen.channel, "node");
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_match() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("input").await.unwrap();
        let mut second = bus.subscribe("input").await.unwrap();
        bus.publish("input", json!({"id": 3, "data": "x"})).await.unwrap();
        assert!(first.next().await.is_some());
        assert!(second.next().await.is_some());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_resumes_delivery() {
        // Overflow the broadcast backlog before the subscriber reads anything;
        // delivery must resume from the oldest retained message instead of
        // tearing the subscription down.
        let bus = MemoryBus::new();
        let mut slow = bus.subscribe("node").await.unwrap();
        for i in 0..(MemoryBus::FEED_CAPACITY + 10) {
            bus.publish("node", json!({"id": i})).await.unwrap();
        }
        let seen = slow.next().await.unwrap();
        assert_eq!(seen.payload["id"], 10);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("trace.error", json!({})).await.unwrap();
    }
}
