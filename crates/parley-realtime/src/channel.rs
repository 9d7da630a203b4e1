use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use parley_core::errors::TransportError;
use parley_core::transport::{Channel, ChannelEvent};

use crate::frame::{self, Frame};
use crate::socket::SocketShared;

/// One topic on a [`crate::PhoenixSocket`].
pub struct PhoenixChannel {
    shared: Arc<SocketShared>,
    topic: String,
    params: Value,
    events: broadcast::Sender<ChannelEvent>,
    join_ref: Mutex<Option<String>>,
}

impl PhoenixChannel {
    pub(crate) fn new(shared: Arc<SocketShared>, topic: &str, params: Value) -> Self {
        let events = shared.topic_sender(topic);
        Self {
            shared,
            topic: topic.to_owned(),
            params,
            events,
            join_ref: Mutex::new(None),
        }
    }

    pub fn is_joined(&self) -> bool {
        self.join_ref.lock().is_some()
    }

    fn frame(&self, event: &str, payload: Value, join_ref: Option<String>) -> Frame {
        let msg_ref = self.shared.make_ref();
        Frame::new(self.topic.clone(), event, payload).with_refs(join_ref, Some(msg_ref))
    }
}

#[async_trait]
impl Channel for PhoenixChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    #[instrument(skip(self), fields(topic = %self.topic))]
    async fn join(&self) -> Result<Value, TransportError> {
        let join_ref = self.shared.make_ref();
        let frame = Frame::new(self.topic.clone(), frame::PHX_JOIN, self.params.clone())
            .with_refs(Some(join_ref.clone()), Some(join_ref.clone()));

        match self.shared.request(frame).await {
            Ok(response) => {
                *self.join_ref.lock() = Some(join_ref);
                debug!("joined");
                Ok(response)
            }
            Err(TransportError::Push { reason, .. }) => Err(TransportError::JoinRefused {
                topic: self.topic.clone(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(topic = %self.topic))]
    async fn leave(&self) -> Result<(), TransportError> {
        let Some(join_ref) = self.join_ref.lock().take() else {
            return Ok(());
        };
        let frame = self.frame(frame::PHX_LEAVE, json!({}), Some(join_ref));
        let _ = self.shared.request(frame).await?;
        debug!("left");
        Ok(())
    }

    async fn push(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        let join_ref = self.join_ref.lock().clone();
        if join_ref.is_none() {
            return Err(TransportError::Push {
                topic: self.topic.clone(),
                event: event.to_owned(),
                reason: "channel not joined".into(),
            });
        }
        let frame = self.frame(event, payload, join_ref);
        self.shared.request(frame).await
    }
}
