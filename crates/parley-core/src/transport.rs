use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::TransportError;
use crate::ids::{AccountId, ConversationId, CustomerId};

/// Channel event names exchanged with the backend.
pub mod event {
    /// A message was created (inbound) or is being sent (outbound).
    pub const SHOUT: &str = "shout";
    /// A conversation was created for the lobby's customer.
    pub const CONVERSATION_CREATED: &str = "conversation:created";
    /// The customer has seen the conversation's messages.
    pub const MESSAGES_SEEN: &str = "messages:seen";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// Account-wide room used for presence.
pub fn account_room_topic(account_id: &AccountId) -> String {
    format!("room:{account_id}")
}

/// Per-customer lobby that announces newly created conversations.
pub fn lobby_topic(customer_id: &CustomerId) -> String {
    format!("conversation:lobby:{customer_id}")
}

pub fn conversation_topic(conversation_id: &ConversationId) -> String {
    format!("conversation:{conversation_id}")
}

/// A named event delivered on a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEvent {
    pub event: String,
    pub payload: Value,
}

impl ChannelEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// A joinable pub/sub topic.
///
/// Subscribers receive every named event the server delivers on the topic;
/// subscribe before joining so nothing sent right after the join is missed.
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Join the topic. Returns the server's join response.
    async fn join(&self) -> Result<Value, TransportError>;

    async fn leave(&self) -> Result<(), TransportError>;

    /// Push an event and wait for the server's reply.
    async fn push(&self, event: &str, payload: Value) -> Result<Value, TransportError>;
}

/// A socket that hands out channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the socket. Channels created from it stop receiving events.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn channel(&self, topic: &str, params: Value) -> Arc<dyn Channel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        let account = AccountId::from_raw("acc");
        let customer = CustomerId::from_raw("cus");
        let conversation = ConversationId::from_raw("conv");
        assert_eq!(account_room_topic(&account), "room:acc");
        assert_eq!(lobby_topic(&customer), "conversation:lobby:cus");
        assert_eq!(conversation_topic(&conversation), "conversation:conv");
    }
}
