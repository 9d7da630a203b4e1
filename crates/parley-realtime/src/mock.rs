use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use parley_core::errors::TransportError;
use parley_core::transport::{Channel, ChannelEvent, RealtimeTransport};

/// One recorded transport operation.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportOp {
    Connect,
    Disconnect,
    Join { topic: String, params: Value },
    Leave { topic: String },
    Push { topic: String, event: String, payload: Value },
}

#[derive(Default)]
struct MockState {
    ops: Mutex<Vec<TransportOp>>,
    topics: Mutex<HashMap<String, broadcast::Sender<ChannelEvent>>>,
    refused: Mutex<HashSet<String>>,
    fail_connect: AtomicBool,
    fail_pushes: AtomicBool,
    connected: AtomicBool,
}

impl MockState {
    fn sender(&self, topic: &str) -> broadcast::Sender<ChannelEvent> {
        self.topics
            .lock()
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(128).0)
            .clone()
    }

    fn record(&self, op: TransportOp) {
        self.ops.lock().push(op);
    }
}

/// In-process transport that records every operation and lets tests
/// inject server events.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self) {
        self.state.fail_connect.store(true, Ordering::Relaxed);
    }

    /// Refuse joins of topics starting with `prefix`.
    pub fn refuse_joins(&self, prefix: &str) {
        let _ = self.state.refused.lock().insert(prefix.to_owned());
    }

    pub fn fail_pushes(&self) {
        self.state.fail_pushes.store(true, Ordering::Relaxed);
    }

    /// Deliver an event to every subscriber of `topic`. Returns how many
    /// subscribers received it.
    pub fn emit(&self, topic: &str, event: &str, payload: Value) -> usize {
        self.state
            .sender(topic)
            .send(ChannelEvent::new(event, payload))
            .unwrap_or(0)
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.state.ops.lock().clone()
    }

    /// Every `(event, payload)` pushed on `topic`.
    pub fn pushes(&self, topic: &str) -> Vec<(String, Value)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Push {
                    topic: t,
                    event,
                    payload,
                } if t == topic => Some((event, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn joined(&self, topic: &str) -> bool {
        self.joined_topics().iter().any(|t| t == topic)
    }

    /// Topics currently joined, in join order.
    pub fn joined_topics(&self) -> Vec<String> {
        let mut joined: Vec<String> = Vec::new();
        for op in self.ops() {
            match op {
                TransportOp::Join { topic, .. } => joined.push(topic),
                TransportOp::Leave { topic } => {
                    if let Some(pos) = joined.iter().position(|t| *t == topic) {
                        let _ = joined.remove(pos);
                    }
                }
                TransportOp::Disconnect => joined.clear(),
                _ => {}
            }
        }
        joined
    }

    /// Highest number of simultaneously joined topics matching `pred` over
    /// the recorded history.
    pub fn peak_joined(&self, pred: impl Fn(&str) -> bool) -> usize {
        let mut current = 0usize;
        let mut peak = 0usize;
        for op in self.ops() {
            match op {
                TransportOp::Join { topic, .. } if pred(&topic) => {
                    current += 1;
                    peak = peak.max(current);
                }
                TransportOp::Leave { topic } if pred(&topic) => {
                    current = current.saturating_sub(1);
                }
                TransportOp::Disconnect => current = 0,
                _ => {}
            }
        }
        peak
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.state.record(TransportOp::Connect);
        if self.state.fail_connect.load(Ordering::Relaxed) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        self.state.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.record(TransportOp::Disconnect);
        self.state.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed)
    }

    fn channel(&self, topic: &str, params: Value) -> Arc<dyn Channel> {
        Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            topic: topic.to_owned(),
            params,
            joined: AtomicBool::new(false),
        })
    }
}

struct MockChannel {
    state: Arc<MockState>,
    topic: String,
    params: Value,
    joined: AtomicBool,
}

#[async_trait]
impl Channel for MockChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.state.sender(&self.topic).subscribe()
    }

    async fn join(&self) -> Result<Value, TransportError> {
        let refused = self
            .state
            .refused
            .lock()
            .iter()
            .any(|prefix| self.topic.starts_with(prefix.as_str()));
        if refused {
            return Err(TransportError::JoinRefused {
                topic: self.topic.clone(),
                reason: "unauthorized".into(),
            });
        }
        self.state.record(TransportOp::Join {
            topic: self.topic.clone(),
            params: self.params.clone(),
        });
        self.joined.store(true, Ordering::Relaxed);
        Ok(json!({}))
    }

    async fn leave(&self) -> Result<(), TransportError> {
        if self.joined.swap(false, Ordering::Relaxed) {
            self.state.record(TransportOp::Leave {
                topic: self.topic.clone(),
            });
        }
        Ok(())
    }

    async fn push(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        self.state.record(TransportOp::Push {
            topic: self.topic.clone(),
            event: event.to_owned(),
            payload,
        });
        if self.state.fail_pushes.load(Ordering::Relaxed) {
            return Err(TransportError::Push {
                topic: self.topic.clone(),
                event: event.to_owned(),
                reason: "rejected".into(),
            });
        }
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_join_push_leave() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        let channel = transport.channel("conversation:c1", json!({"customer_id": "u1"}));

        channel.join().await.unwrap();
        assert!(transport.joined("conversation:c1"));

        let _ = channel.push("shout", json!({"body": "hi"})).await.unwrap();
        assert_eq!(transport.pushes("conversation:c1")[0].1["body"], "hi");

        channel.leave().await.unwrap();
        channel.leave().await.unwrap();
        assert!(transport.joined_topics().is_empty());
        assert_eq!(transport.peak_joined(|_| true), 1);
    }

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let transport = MockTransport::new();
        let channel = transport.channel("room:a", json!({}));
        let mut rx = channel.subscribe();

        assert_eq!(transport.emit("room:a", "presence_state", json!({})), 1);
        assert_eq!(rx.recv().await.unwrap().event, "presence_state");
        assert_eq!(transport.emit("room:b", "presence_state", json!({})), 0);
    }

    #[tokio::test]
    async fn refused_join() {
        let transport = MockTransport::new();
        transport.refuse_joins("room:");
        let err = transport.channel("room:a", json!({})).join().await.unwrap_err();
        assert!(matches!(err, TransportError::JoinRefused { .. }));
        assert!(transport.joined_topics().is_empty());
    }

    #[tokio::test]
    async fn failed_connect() {
        let transport = MockTransport::new();
        transport.fail_connect();
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
    }
}
