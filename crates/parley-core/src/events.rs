use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, CustomerId};
use crate::messages::Message;
use crate::presence::PresenceEntry;
use crate::widget::WidgetSettings;

/// Notifications emitted by a chat session, in the order the underlying
/// mutations happen. Every variant has a matching callback in the session
/// configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "customer_id_set")]
    CustomerIdSet { customer_id: Option<CustomerId> },

    #[serde(rename = "conversation_id_set")]
    ConversationIdSet { conversation_id: ConversationId },

    #[serde(rename = "settings_applied")]
    SettingsApplied { settings: WidgetSettings },

    #[serde(rename = "presence_synced")]
    PresenceSynced { presences: Vec<PresenceEntry> },

    #[serde(rename = "conversation_created")]
    ConversationCreated {
        customer_id: CustomerId,
        conversation_id: ConversationId,
    },

    #[serde(rename = "message_created")]
    MessageCreated { message: Message },

    /// Carries the full transcript after every change.
    #[serde(rename = "messages_updated")]
    MessagesUpdated { messages: Vec<Message> },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CustomerIdSet { .. } => "customer_id_set",
            Self::ConversationIdSet { .. } => "conversation_id_set",
            Self::SettingsApplied { .. } => "settings_applied",
            Self::PresenceSynced { .. } => "presence_synced",
            Self::ConversationCreated { .. } => "conversation_created",
            Self::MessageCreated { .. } => "message_created",
            Self::MessagesUpdated { .. } => "messages_updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            SessionEvent::CustomerIdSet { customer_id: None },
            SessionEvent::ConversationIdSet {
                conversation_id: ConversationId::from_raw("c"),
            },
            SessionEvent::SettingsApplied {
                settings: WidgetSettings::default(),
            },
            SessionEvent::PresenceSynced { presences: vec![] },
            SessionEvent::MessagesUpdated { messages: vec![] },
        ];
        for evt in &events {
            let json = serde_json::to_value(evt).unwrap();
            assert_eq!(json["type"], evt.event_type());
        }
    }

    #[test]
    fn customer_id_set_carries_null() {
        let json = serde_json::to_value(SessionEvent::CustomerIdSet { customer_id: None }).unwrap();
        assert!(json["customer_id"].is_null());
    }
}
