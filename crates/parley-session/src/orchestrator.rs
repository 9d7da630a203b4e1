//! Session orchestrator: owns identity, the transcript and the realtime
//! channels of one embedded chat.
//!
//! State lives behind a synchronous mutex that is never held across an
//! await point, so every reaction to a network completion or channel event
//! is applied atomically. Each channel slot (presence room, customer lobby,
//! conversation) is guarded by an async mutex so that replacing a channel
//! always leaves the old topic before the new one is joined.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::api::BackendApi;
use parley_core::errors::TransportError;
use parley_core::events::SessionEvent;
use parley_core::ids::{AccountId, ConversationId, CustomerId};
use parley_core::messages::{Conversation, CustomerFilters, CustomerMetadata, Message, MessageType};
use parley_core::presence::Presence;
use parley_core::transport::{
    account_room_topic, conversation_topic, event, lobby_topic, Channel, ChannelEvent,
    RealtimeTransport,
};
use parley_core::widget::WidgetSettings;
use parley_store::IdentityCache;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::greeting::default_messages;
use crate::reconcile::{find_pending, reconcile, sort_chronologically};

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct SessionState {
    customer_id: Option<CustomerId>,
    conversation_id: Option<ConversationId>,
    settings: WidgetSettings,
    messages: Vec<Message>,
    metadata: Option<CustomerMetadata>,
}

/// A joined channel and the token that stops its listener task.
struct ChannelSlot {
    channel: Arc<dyn Channel>,
    listener: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelKind {
    Presence,
    Lobby,
    Conversation,
}

struct SessionInner {
    config: SessionConfig,
    api: Arc<dyn BackendApi>,
    transport: Arc<dyn RealtimeTransport>,
    cache: Arc<dyn IdentityCache>,
    state: Mutex<SessionState>,
    presence: AsyncMutex<Option<ChannelSlot>>,
    lobby: AsyncMutex<Option<ChannelSlot>>,
    conversation: AsyncMutex<Option<ChannelSlot>>,
    /// Held while a customer or conversation is being created.
    creation: AsyncMutex<()>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to one chat session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<SessionInner>,
}

impl SessionOrchestrator {
    pub fn new(
        config: SessionConfig,
        api: Arc<dyn BackendApi>,
        transport: Arc<dyn RealtimeTransport>,
        cache: Arc<dyn IdentityCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SessionState {
            metadata: config.customer.clone(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(SessionInner {
                config,
                api,
                transport,
                cache,
                state: Mutex::new(state),
                presence: AsyncMutex::new(None),
                lobby: AsyncMutex::new(None),
                conversation: AsyncMutex::new(None),
                creation: AsyncMutex::new(()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn account_id(&self) -> &AccountId {
        &self.inner.config.account_id
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.inner.state.lock().customer_id.clone()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.inner.state.lock().conversation_id.clone()
    }

    /// Snapshot of the transcript.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().messages.clone()
    }

    pub fn settings(&self) -> WidgetSettings {
        self.inner.state.lock().settings.clone()
    }

    /// Receive every [`SessionEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn notify(&self, event: SessionEvent) {
        debug!(event_type = event.event_type(), "session event");
        self.inner.config.callbacks.dispatch(&event);
        let _ = self.inner.events.send(event);
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Run the startup sequence and resolve the latest conversation.
    ///
    /// Never fails: every step degrades to a safe default and logs.
    #[instrument(skip(self), fields(account_id = %self.inner.config.account_id))]
    pub async fn start(&self) -> Option<Conversation> {
        if self.is_disconnected() {
            return None;
        }

        if let Err(e) = self.connect().await {
            warn!(error = %e, "realtime connect failed, continuing without live updates");
        }

        let settings = match self.inner.api.fetch_widget_settings(self.account_id()).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "widget settings unavailable, using defaults");
                WidgetSettings::default()
            }
        };
        if self.is_disconnected() {
            return None;
        }

        self.report_location().await;

        let customer_id = self.resolve_customer_id().await;
        if self.is_disconnected() {
            return None;
        }

        self.apply_settings(settings);
        self.set_customer_id(customer_id);
        self.fetch_latest_conversation().await
    }

    /// Open the socket and join the account presence room.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        self.inner.transport.connect().await?;

        let topic = account_room_topic(self.account_id());
        if let Err(e) = self.open_channel(ChannelKind::Presence, topic.clone(), json!({})).await {
            warn!(topic = %topic, error = %e, "presence join failed");
        }
        Ok(())
    }

    /// Tear the session down. In-flight operations complete as no-ops.
    pub async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        for kind in [ChannelKind::Conversation, ChannelKind::Lobby, ChannelKind::Presence] {
            self.close_channel(kind).await;
        }
        self.inner.transport.disconnect().await;
        info!(account_id = %self.account_id(), "session disconnected");
    }

    async fn report_location(&self) {
        let Some(location) = self.inner.config.customer.as_ref().and_then(CustomerMetadata::location)
        else {
            return;
        };
        if let Err(e) = self
            .inner
            .api
            .update_widget_settings_metadata(self.account_id(), &location)
            .await
        {
            warn!(error = %e, "failed to report widget location");
        }
    }

    // ── Identity ────────────────────────────────────────────────────

    async fn resolve_customer_id(&self) -> Option<CustomerId> {
        let mut customer_id = match self.candidate_customer_id() {
            Some(raw) => self.validate_customer_id(&raw).await,
            None => None,
        };

        let metadata = self.inner.config.customer.as_ref();
        if let Some((external_id, metadata)) = metadata.and_then(|m| m.external_id().map(|id| (id, m))) {
            let filters = CustomerFilters::from(metadata);
            match self
                .inner
                .api
                .find_customer_by_external_id(external_id, self.account_id(), &filters)
                .await
            {
                Ok(found) => {
                    if found != customer_id {
                        debug!(external_id, found = ?found, "external id mapping overrides candidate");
                    }
                    customer_id = found;
                }
                Err(e) => warn!(external_id, error = %e, "external id lookup failed, keeping candidate"),
            }
        }

        customer_id
    }

    fn candidate_customer_id(&self) -> Option<String> {
        let configured = self
            .inner
            .config
            .customer_id
            .as_deref()
            .filter(|id| !id.trim().is_empty());
        if let Some(id) = configured {
            return Some(id.to_owned());
        }
        match self.inner.cache.customer_id() {
            Ok(cached) => cached.map(|id| id.as_str().to_owned()),
            Err(e) => {
                warn!(error = %e, "identity cache read failed");
                None
            }
        }
    }

    async fn validate_customer_id(&self, raw: &str) -> Option<CustomerId> {
        let Some(customer_id) = CustomerId::parse(raw) else {
            debug!(raw, "discarding malformed customer id");
            return None;
        };
        match self.inner.api.is_valid_customer(&customer_id, self.account_id()).await {
            Ok(true) => Some(customer_id),
            Ok(false) => {
                info!(customer_id = %customer_id, "customer no longer exists");
                None
            }
            Err(e) => {
                warn!(customer_id = %customer_id, error = %e, "customer validation failed, assuming valid");
                Some(customer_id)
            }
        }
    }

    /// Replace the customer id, persist it (or clear the cache for `None`)
    /// and notify.
    pub fn set_customer_id(&self, customer_id: Option<CustomerId>) {
        if self.is_disconnected() {
            return;
        }
        self.inner.state.lock().customer_id = customer_id.clone();

        let persisted = match &customer_id {
            Some(id) => self.inner.cache.set_customer_id(id),
            None => self.inner.cache.remove_customer_id(),
        };
        if let Err(e) = persisted {
            warn!(error = %e, "identity cache write failed");
        }

        self.notify(SessionEvent::CustomerIdSet { customer_id });
    }

    /// Update the current customer's metadata, or create the customer when
    /// none exists yet.
    #[instrument(skip_all)]
    pub async fn identify(&self, metadata: CustomerMetadata) -> Result<CustomerId, SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        self.inner.state.lock().metadata = Some(metadata);

        let _creating = self.inner.creation.lock().await;
        let customer_id = self.create_or_update_customer().await?;
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        if self.customer_id().as_ref() != Some(&customer_id) {
            self.set_customer_id(Some(customer_id.clone()));
        }
        Ok(customer_id)
    }

    /// Update the known customer, falling back to creating a new one once.
    async fn create_or_update_customer(&self) -> Result<CustomerId, SessionError> {
        let metadata = self.inner.state.lock().metadata.clone().unwrap_or_default();

        if let Some(customer_id) = self.customer_id() {
            match self
                .inner
                .api
                .update_customer_metadata(&customer_id, &metadata)
                .await
            {
                Ok(customer) => return Ok(customer.id),
                Err(e) => {
                    warn!(customer_id = %customer_id, error = %e, "customer update failed, creating a new customer");
                }
            }
        }

        let customer = self.inner.api.create_customer(self.account_id(), &metadata).await?;
        info!(customer_id = %customer.id, "customer created");
        Ok(customer.id)
    }

    // ── Settings & transcript ───────────────────────────────────────

    fn apply_settings(&self, settings: WidgetSettings) {
        self.inner.state.lock().settings = settings.clone();
        self.notify(SessionEvent::SettingsApplied { settings });
    }

    /// Replace the whole transcript and notify.
    pub fn set_messages(&self, messages: Vec<Message>) {
        if self.is_disconnected() {
            return;
        }
        self.inner.state.lock().messages = messages.clone();
        self.notify(SessionEvent::MessagesUpdated { messages });
    }

    fn show_greeting(&self) {
        let settings = self.settings();
        self.set_messages(default_messages(&self.inner.config.greeting, &settings, Utc::now()));
    }

    // ── Conversations ───────────────────────────────────────────────

    /// Record the conversation id and join its channel, leaving any
    /// previously joined conversation first.
    pub async fn set_conversation_id(&self, conversation_id: ConversationId) {
        if self.is_disconnected() {
            return;
        }
        self.inner.state.lock().conversation_id = Some(conversation_id.clone());
        self.notify(SessionEvent::ConversationIdSet {
            conversation_id: conversation_id.clone(),
        });
        self.join_conversation(&conversation_id).await;
    }

    /// Conversation id and transcript in one step. Local sends the fetched
    /// transcript does not confirm yet stay at its end.
    async fn set_conversation(&self, conversation_id: ConversationId, mut messages: Vec<Message>) {
        if self.is_disconnected() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            let unconfirmed: Vec<Message> = state
                .messages
                .iter()
                .filter(|local| local.is_pending())
                .filter(|local| {
                    !messages
                        .iter()
                        .any(|fetched| find_pending(std::slice::from_ref(*local), fetched).is_some())
                })
                .cloned()
                .collect();
            messages.extend(unconfirmed);
            state.conversation_id = Some(conversation_id.clone());
            state.messages = messages.clone();
        }
        self.notify(SessionEvent::ConversationIdSet {
            conversation_id: conversation_id.clone(),
        });
        self.notify(SessionEvent::MessagesUpdated { messages });
        self.join_conversation(&conversation_id).await;
    }

    async fn join_conversation(&self, conversation_id: &ConversationId) {
        let params = json!({ "customer_id": self.customer_id() });
        let topic = conversation_topic(conversation_id);
        if let Err(e) = self.open_channel(ChannelKind::Conversation, topic, params).await {
            warn!(conversation_id = %conversation_id, error = %e, "conversation join failed");
        }
    }

    /// Resolve the customer's most recent conversation and load it.
    ///
    /// Without a customer, or when the lookup fails, the transcript falls
    /// back to the greeting. When the customer has no conversation yet the
    /// lobby is joined to learn when one is created.
    #[instrument(skip(self))]
    pub async fn fetch_latest_conversation(&self) -> Option<Conversation> {
        let Some(customer_id) = self.customer_id() else {
            self.show_greeting();
            return None;
        };

        let conversations = match self
            .inner
            .api
            .fetch_customer_conversations(&customer_id, self.account_id())
            .await
        {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!(customer_id = %customer_id, error = %e, "conversation lookup failed");
                self.show_greeting();
                return None;
            }
        };
        if self.is_disconnected() {
            return None;
        }

        match conversations.into_iter().next() {
            Some(conversation) => {
                self.apply_conversation(conversation.clone()).await;
                Some(conversation)
            }
            None => {
                self.show_greeting();
                let topic = lobby_topic(&customer_id);
                if let Err(e) = self.open_channel(ChannelKind::Lobby, topic.clone(), json!({})).await {
                    warn!(topic = %topic, error = %e, "lobby join failed");
                }
                None
            }
        }
    }

    /// Load a conversation: chronological transcript with the greeting
    /// pinned to the first message's creation time.
    async fn apply_conversation(&self, conversation: Conversation) {
        let mut messages = conversation.messages;
        sort_chronologically(&mut messages);

        let pinned_at = messages.first().and_then(|m| m.created_at).unwrap_or_else(Utc::now);
        let settings = self.settings();
        let mut transcript = default_messages(&self.inner.config.greeting, &settings, pinned_at);
        transcript.extend(messages);

        self.set_conversation(conversation.id, transcript).await;
    }

    /// The lobby announced a new conversation. Poll with backoff until its
    /// messages are fetchable, then load it. A conversation this session
    /// created meanwhile is kept as is.
    async fn on_conversation_created(&self) {
        let Some(customer_id) = self.customer_id() else {
            return;
        };
        if let Some(conversation_id) = self.conversation_id() {
            self.conversation_announced(customer_id, conversation_id).await;
            return;
        }

        let backoff = &self.inner.config.backoff;
        let attempts = backoff.max_attempts.max(1);
        for attempt in 0..attempts {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff.delay(attempt)) => {}
            }
            if let Some(conversation_id) = self.conversation_id() {
                self.conversation_announced(customer_id, conversation_id).await;
                return;
            }

            let conversations = match self
                .inner
                .api
                .fetch_customer_conversations(&customer_id, self.account_id())
                .await
            {
                Ok(conversations) => conversations,
                Err(e) => {
                    debug!(attempt, error = %e, "announced conversation not fetchable yet");
                    continue;
                }
            };
            if self.is_disconnected() {
                return;
            }
            if let Some(conversation_id) = self.conversation_id() {
                self.conversation_announced(customer_id, conversation_id).await;
                return;
            }

            let last = attempt + 1 == attempts;
            let ready = conversations
                .into_iter()
                .next()
                .filter(|c| last || !c.messages.is_empty());
            if let Some(conversation) = ready {
                let conversation_id = conversation.id.clone();
                self.apply_conversation(conversation).await;
                self.conversation_announced(customer_id, conversation_id).await;
                return;
            }
        }

        warn!(customer_id = %customer_id, attempts, "announced conversation never became available");
    }

    async fn conversation_announced(&self, customer_id: CustomerId, conversation_id: ConversationId) {
        self.notify(SessionEvent::ConversationCreated {
            customer_id,
            conversation_id,
        });
        self.close_channel(ChannelKind::Lobby).await;
    }

    /// Create the customer and conversation if either is missing. Only one
    /// caller creates; the others wait and reuse the result.
    async fn ensure_conversation(&self) -> Result<(CustomerId, ConversationId), SessionError> {
        if let (Some(customer_id), Some(conversation_id)) = (self.customer_id(), self.conversation_id()) {
            return Ok((customer_id, conversation_id));
        }

        let _creating = self.inner.creation.lock().await;

        let customer_id = match self.customer_id() {
            Some(id) => id,
            None => {
                let id = self.create_or_update_customer().await?;
                if self.is_disconnected() {
                    return Err(SessionError::Disconnected);
                }
                self.set_customer_id(Some(id.clone()));
                id
            }
        };

        if let Some(conversation_id) = self.conversation_id() {
            return Ok((customer_id, conversation_id));
        }

        let conversation = self
            .inner
            .api
            .create_conversation(self.account_id(), &customer_id)
            .await?;
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        info!(customer_id = %customer_id, conversation_id = %conversation.id, "conversation created");
        self.set_conversation_id(conversation.id.clone()).await;
        Ok((customer_id, conversation.id))
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Send a customer message.
    ///
    /// The message is appended to the transcript as pending before any
    /// network call; the server's echo later replaces it in place.
    #[instrument(skip_all, fields(files = file_ids.len()))]
    pub async fn send_message(&self, body: Option<String>, file_ids: Vec<String>) -> Result<(), SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        let body = body.filter(|b| !b.trim().is_empty());
        if body.is_none() && file_ids.is_empty() {
            debug!("ignoring empty message");
            return Ok(());
        }

        let message = Message::customer(body, file_ids, self.customer_id(), Utc::now());
        let messages = {
            let mut state = self.inner.state.lock();
            state.messages.push(message.clone());
            state.messages.clone()
        };
        self.notify(SessionEvent::MessagesUpdated { messages });

        let (customer_id, conversation_id) = self.ensure_conversation().await?;
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }

        let Some(channel) = self.slot_channel(ChannelKind::Conversation).await else {
            warn!(conversation_id = %conversation_id, "no joined conversation channel, message not pushed");
            return Ok(());
        };

        let mut outgoing = message;
        outgoing.customer_id = Some(customer_id);
        outgoing.conversation_id = Some(conversation_id);
        outgoing.account_id = Some(self.account_id().clone());
        let payload = serde_json::to_value(&outgoing).map_err(|e| TransportError::Encode(e.to_string()))?;

        let _ = channel.push(event::SHOUT, payload).await?;
        Ok(())
    }

    /// Acknowledge agent messages as seen and stamp them locally.
    pub async fn mark_messages_seen(&self) -> Result<(), SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Disconnected);
        }
        if let Some(channel) = self.slot_channel(ChannelKind::Conversation).await {
            let _ = channel.push(event::MESSAGES_SEEN, json!({})).await?;
        }

        let now = Utc::now();
        let messages = {
            let mut state = self.inner.state.lock();
            let mut changed = false;
            for message in state.messages.iter_mut().filter(|m| {
                m.message_type == MessageType::Agent && m.is_confirmed() && m.seen_at.is_none()
            }) {
                message.seen_at = Some(now);
                changed = true;
            }
            changed.then(|| state.messages.clone())
        };
        if let Some(messages) = messages {
            self.notify(SessionEvent::MessagesUpdated { messages });
        }
        Ok(())
    }

    /// A message arrived on the conversation channel.
    fn on_message(&self, payload: Value) {
        if self.is_disconnected() {
            return;
        }
        let mut message: Message = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed message event");
                return;
            }
        };
        if message.created_at.is_none() {
            message.created_at = Some(Utc::now());
        }

        let messages = {
            let mut state = self.inner.state.lock();
            let outcome = reconcile(&mut state.messages, message.clone());
            debug!(?outcome, "message reconciled");
            state.messages.clone()
        };
        self.notify(SessionEvent::MessagesUpdated { messages });
        self.notify(SessionEvent::MessageCreated { message });
    }

    // ── Channels ────────────────────────────────────────────────────

    fn slot(&self, kind: ChannelKind) -> &AsyncMutex<Option<ChannelSlot>> {
        match kind {
            ChannelKind::Presence => &self.inner.presence,
            ChannelKind::Lobby => &self.inner.lobby,
            ChannelKind::Conversation => &self.inner.conversation,
        }
    }

    async fn slot_channel(&self, kind: ChannelKind) -> Option<Arc<dyn Channel>> {
        self.slot(kind)
            .lock()
            .await
            .as_ref()
            .map(|slot| Arc::clone(&slot.channel))
    }

    /// Leave whatever occupies the slot, then join `topic` into it.
    async fn open_channel(&self, kind: ChannelKind, topic: String, params: Value) -> Result<(), TransportError> {
        let mut slot = self.slot(kind).lock().await;
        if slot.as_ref().is_some_and(|current| current.channel.topic() == topic) {
            return Ok(());
        }
        if let Some(previous) = slot.take() {
            leave_slot(previous).await;
        }
        if self.is_disconnected() {
            return Ok(());
        }

        let channel = self.inner.transport.channel(&topic, params);
        let events = channel.subscribe();
        let _ = channel.join().await?;
        debug!(topic = %topic, ?kind, "channel joined");

        let listener = self.inner.shutdown.child_token();
        self.spawn_listener(kind, events, listener.clone());
        *slot = Some(ChannelSlot { channel, listener });
        Ok(())
    }

    async fn close_channel(&self, kind: ChannelKind) {
        let previous = self.slot(kind).lock().await.take();
        if let Some(previous) = previous {
            leave_slot(previous).await;
        }
    }

    fn spawn_listener(
        &self,
        kind: ChannelKind,
        mut events: broadcast::Receiver<ChannelEvent>,
        token: CancellationToken,
    ) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut presence = Presence::new();
            loop {
                let evt = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(evt) => evt,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, ?kind, "channel listener lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let Some(session) = Self::upgrade(&weak) else {
                    break;
                };

                match kind {
                    ChannelKind::Presence => {
                        if presence.apply(&evt) {
                            session.notify(SessionEvent::PresenceSynced {
                                presences: presence.list(),
                            });
                        }
                    }
                    ChannelKind::Lobby => {
                        if evt.event == event::CONVERSATION_CREATED {
                            session.on_conversation_created().await;
                        }
                    }
                    ChannelKind::Conversation => {
                        if evt.event == event::SHOUT {
                            session.on_message(evt.payload);
                        }
                    }
                }
            }
            debug!(?kind, "channel listener stopped");
        });
    }
}

async fn leave_slot(slot: ChannelSlot) {
    slot.listener.cancel();
    if let Err(e) = slot.channel.leave().await {
        warn!(topic = slot.channel.topic(), error = %e, "channel leave failed");
    }
}
