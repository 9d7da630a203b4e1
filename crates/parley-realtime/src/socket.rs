use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use parley_core::errors::TransportError;
use parley_core::transport::{Channel, ChannelEvent, RealtimeTransport};

use crate::channel::PhoenixChannel;
use crate::frame::{self, Frame};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_QUEUE: usize = 64;
const CHANNEL_BUFFER: usize = 128;

/// Reply payload (or error reason) for a pending push.
type PendingTx = oneshot::Sender<Result<Value, String>>;

#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Websocket endpoint, e.g. `wss://app.papercups.io/socket/websocket`.
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reply_timeout: Duration,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    /// Endpoint with the serializer version Phoenix expects.
    pub fn endpoint(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}vsn=2.0.0", self.url)
    }
}

/// State shared between the socket handle, its channels and the
/// reader/writer tasks.
pub(crate) struct SocketShared {
    config: SocketConfig,
    out_tx: Mutex<Option<mpsc::Sender<String>>>,
    pending: DashMap<String, PendingTx>,
    topics: DashMap<String, broadcast::Sender<ChannelEvent>>,
    next_ref: AtomicU64,
    connected: AtomicBool,
}

impl SocketShared {
    pub(crate) fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        self.config.reply_timeout
    }

    /// Broadcast sender for a topic, shared by every channel on that topic.
    pub(crate) fn topic_sender(&self, topic: &str) -> broadcast::Sender<ChannelEvent> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .clone()
    }

    /// Send a frame carrying `msg_ref` and wait for its `phx_reply`.
    pub(crate) async fn request(&self, frame: Frame) -> Result<Value, TransportError> {
        let msg_ref = frame.msg_ref.clone().unwrap_or_else(|| self.make_ref());
        let frame = Frame {
            msg_ref: Some(msg_ref.clone()),
            ..frame
        };
        let topic = frame.topic.clone();
        let event = frame.event.clone();

        let Some(out_tx) = self.out_tx.lock().clone() else {
            return Err(TransportError::NotConnected);
        };

        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(msg_ref.clone(), tx);

        if out_tx.send(frame.encode()).await.is_err() {
            let _ = self.pending.remove(&msg_ref);
            return Err(TransportError::Closed);
        }

        let reply = match tokio::time::timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                let _ = self.pending.remove(&msg_ref);
                return Err(TransportError::Timeout { topic, event });
            }
        };

        reply.map_err(|reason| TransportError::Push {
            topic,
            event,
            reason,
        })
    }

    fn dispatch(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        if frame.event == frame::PHX_REPLY {
            let Some(msg_ref) = frame.msg_ref.as_deref() else {
                return;
            };
            if let Some((_, tx)) = self.pending.remove(msg_ref) {
                let _ = tx.send(frame::reply_result(frame.payload));
            }
            return;
        }

        if frame.event == frame::PHX_ERROR || frame.event == frame::PHX_CLOSE {
            warn!(topic = %frame.topic, event = %frame.event, "channel closed by server");
        }

        match self.topics.get(&frame.topic) {
            Some(sender) => {
                trace!(topic = %frame.topic, event = %frame.event, "dispatching event");
                let _ = sender.send(ChannelEvent::new(frame.event, frame.payload));
            }
            None => debug!(topic = %frame.topic, event = %frame.event, "event for unknown topic"),
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.out_tx.lock().take();
        // Dropping the senders fails every waiter with `Closed`.
        self.pending.clear();
    }
}

/// A Phoenix socket over tokio-tungstenite.
///
/// One writer task serialises outbound frames and heartbeats; one reader
/// task routes replies to waiting pushes and events to channel subscribers.
/// Reconnection is left to the caller.
pub struct PhoenixSocket {
    shared: Arc<SocketShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PhoenixSocket {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            shared: Arc::new(SocketShared {
                config,
                out_tx: Mutex::new(None),
                pending: DashMap::new(),
                topics: DashMap::new(),
                next_ref: AtomicU64::new(1),
                connected: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixSocket {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = self.shared.config.endpoint();
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(SEND_QUEUE);
        *self.shared.out_tx.lock() = Some(out_tx);
        self.shared.connected.store(true, Ordering::Relaxed);
        info!(url = %self.shared.config.url, "socket connected");

        let writer_shared = Arc::clone(&self.shared);
        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(writer_shared.config.heartbeat_interval);
            heartbeat.tick().await; // consume first immediate tick

            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        match msg {
                            Some(text) => {
                                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = ws_tx.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        let frame = Frame::heartbeat(writer_shared.make_ref());
                        if ws_tx.send(Message::Text(frame.encode().into())).await.is_err() {
                            break;
                        }
                        trace!("sent heartbeat");
                    }
                }
            }
            writer_shared.mark_closed();
        });

        let reader_shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => reader_shared.dispatch(&text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            if reader_shared.connected.load(Ordering::Relaxed) {
                warn!("socket closed by server");
            }
            reader_shared.mark_closed();
        });

        let mut tasks = self.tasks.lock();
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.mark_closed();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!("socket disconnected");
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    fn channel(&self, topic: &str, params: Value) -> Arc<dyn Channel> {
        Arc::new(PhoenixChannel::new(Arc::clone(&self.shared), topic, params))
    }
}

impl Drop for PhoenixSocket {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared() -> SocketShared {
        SocketShared {
            config: SocketConfig::new("ws://localhost/socket/websocket"),
            out_tx: Mutex::new(None),
            pending: DashMap::new(),
            topics: DashMap::new(),
            next_ref: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    #[test]
    fn endpoint_appends_vsn() {
        assert_eq!(
            SocketConfig::new("ws://h/socket/websocket").endpoint(),
            "ws://h/socket/websocket?vsn=2.0.0"
        );
        assert_eq!(
            SocketConfig::new("ws://h/socket/websocket?token=t").endpoint(),
            "ws://h/socket/websocket?token=t&vsn=2.0.0"
        );
    }

    #[test]
    fn refs_increase() {
        let shared = shared();
        assert_eq!(shared.make_ref(), "1");
        assert_eq!(shared.make_ref(), "2");
    }

    #[tokio::test]
    async fn request_without_connection_fails() {
        let shared = shared();
        let err = shared
            .request(Frame::new("room:a", frame::PHX_JOIN, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn dispatch_routes_reply_to_pending() {
        let shared = shared();
        let (tx, rx) = oneshot::channel();
        let _ = shared.pending.insert("5".into(), tx);

        shared.dispatch(r#"["1","5","room:a","phx_reply",{"status":"ok","response":{"n":1}}]"#);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"n": 1}));
        assert!(shared.pending.is_empty());
    }

    #[tokio::test]
    async fn dispatch_routes_events_by_topic() {
        let shared = shared();
        let mut a = shared.topic_sender("room:a").subscribe();
        let mut b = shared.topic_sender("room:b").subscribe();

        shared.dispatch(r#"[null,null,"room:a","shout",{"body":"hi"}]"#);

        let evt = a.recv().await.unwrap();
        assert_eq!(evt.event, "shout");
        assert_eq!(evt.payload["body"], "hi");
        assert!(b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_clears_pending() {
        let shared = shared();
        let (tx, mut rx) = mpsc::channel(4);
        *shared.out_tx.lock() = Some(tx);

        let err = shared
            .request(Frame::new("room:a", "shout", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(shared.pending.is_empty());
        assert!(rx.recv().await.unwrap().contains("\"shout\""));
    }
}
