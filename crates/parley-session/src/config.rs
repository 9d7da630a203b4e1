use std::fmt;
use std::sync::Arc;

use parley_core::events::SessionEvent;
use parley_core::ids::{AccountId, ConversationId, CustomerId};
use parley_core::messages::{CustomerMetadata, Message};
use parley_core::presence::PresenceEntry;
use parley_core::widget::WidgetSettings;

use crate::backoff::BackoffConfig;
use crate::greeting::GreetingConfig;

/// Embedder hooks, each invoked synchronously right after the matching
/// state change and before the [`SessionEvent`] is broadcast.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_customer_id_set: Option<Arc<dyn Fn(Option<&CustomerId>) + Send + Sync>>,
    pub on_conversation_id_set: Option<Arc<dyn Fn(&ConversationId) + Send + Sync>>,
    pub on_settings_applied: Option<Arc<dyn Fn(&WidgetSettings) + Send + Sync>>,
    pub on_presence_sync: Option<Arc<dyn Fn(&[PresenceEntry]) + Send + Sync>>,
    pub on_conversation_created: Option<Arc<dyn Fn(&CustomerId, &ConversationId) + Send + Sync>>,
    pub on_message_created: Option<Arc<dyn Fn(&Message) + Send + Sync>>,
    pub on_messages_updated: Option<Arc<dyn Fn(&[Message]) + Send + Sync>>,
}

impl SessionCallbacks {
    pub(crate) fn dispatch(&self, event: &SessionEvent) {
        match event {
            SessionEvent::CustomerIdSet { customer_id } => {
                if let Some(cb) = &self.on_customer_id_set {
                    cb(customer_id.as_ref());
                }
            }
            SessionEvent::ConversationIdSet { conversation_id } => {
                if let Some(cb) = &self.on_conversation_id_set {
                    cb(conversation_id);
                }
            }
            SessionEvent::SettingsApplied { settings } => {
                if let Some(cb) = &self.on_settings_applied {
                    cb(settings);
                }
            }
            SessionEvent::PresenceSynced { presences } => {
                if let Some(cb) = &self.on_presence_sync {
                    cb(presences.as_slice());
                }
            }
            SessionEvent::ConversationCreated {
                customer_id,
                conversation_id,
            } => {
                if let Some(cb) = &self.on_conversation_created {
                    cb(customer_id, conversation_id);
                }
            }
            SessionEvent::MessageCreated { message } => {
                if let Some(cb) = &self.on_message_created {
                    cb(message);
                }
            }
            SessionEvent::MessagesUpdated { messages } => {
                if let Some(cb) = &self.on_messages_updated {
                    cb(messages.as_slice());
                }
            }
        }
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_customer_id_set", &self.on_customer_id_set.is_some())
            .field("on_conversation_id_set", &self.on_conversation_id_set.is_some())
            .field("on_settings_applied", &self.on_settings_applied.is_some())
            .field("on_presence_sync", &self.on_presence_sync.is_some())
            .field("on_conversation_created", &self.on_conversation_created.is_some())
            .field("on_message_created", &self.on_message_created.is_some())
            .field("on_messages_updated", &self.on_messages_updated.is_some())
            .finish()
    }
}

/// Everything a session needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub account_id: AccountId,
    /// Explicit customer id. Takes precedence over the identity cache but is
    /// still validated.
    pub customer_id: Option<String>,
    /// Identify record from the embedding page.
    pub customer: Option<CustomerMetadata>,
    pub greeting: GreetingConfig,
    pub backoff: BackoffConfig,
    pub callbacks: SessionCallbacks,
}

impl SessionConfig {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            customer_id: None,
            customer: None,
            greeting: GreetingConfig::default(),
            backoff: BackoffConfig::default(),
            callbacks: SessionCallbacks::default(),
        }
    }
}
