use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::api::BackendApi;
use parley_core::errors::ApiError;
use parley_core::ids::{AccountId, ConversationId, CustomerId};
use parley_core::messages::{Conversation, Customer, CustomerFilters, CustomerMetadata};
use parley_core::widget::WidgetSettings;

/// Customer id handed out by [`MockBackendApi`] unless scripted otherwise.
pub const MOCK_CUSTOMER_ID: &str = "22222222-2222-2222-2222-222222222222";
/// Conversation id handed out by [`MockBackendApi`] unless scripted otherwise.
pub const MOCK_CONVERSATION_ID: &str = "33333333-3333-3333-3333-333333333333";

/// One recorded backend call.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    FetchWidgetSettings,
    UpdateWidgetSettingsMetadata { metadata: serde_json::Value },
    CreateCustomer { metadata: CustomerMetadata },
    UpdateCustomerMetadata { customer_id: CustomerId },
    FindCustomerByExternalId { external_id: String, filters: CustomerFilters },
    IsValidCustomer { customer_id: CustomerId },
    CreateConversation { customer_id: CustomerId },
    FetchCustomerConversations { customer_id: CustomerId },
}

/// Queued responses; once drained, every call gets `fallback`.
struct Script<T> {
    queue: VecDeque<Result<T, ApiError>>,
    fallback: Result<T, ApiError>,
}

impl<T: Clone> Script<T> {
    fn new(fallback: Result<T, ApiError>) -> Self {
        Self {
            queue: VecDeque::new(),
            fallback,
        }
    }

    fn next(&mut self) -> Result<T, ApiError> {
        self.queue.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Scripted backend for deterministic tests without a server.
pub struct MockBackendApi {
    settings: Mutex<Script<WidgetSettings>>,
    settings_metadata: Mutex<Script<()>>,
    create_customer: Mutex<Script<Customer>>,
    update_customer: Mutex<Script<Customer>>,
    external_lookup: Mutex<Script<Option<CustomerId>>>,
    valid_customer: Mutex<Script<bool>>,
    create_conversation: Mutex<Script<Conversation>>,
    conversations: Mutex<Script<Vec<Conversation>>>,
    create_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl Default for MockBackendApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackendApi {
    /// Backend with empty settings, no known customers and no conversations.
    /// Creates succeed with [`MOCK_CUSTOMER_ID`] / [`MOCK_CONVERSATION_ID`].
    pub fn new() -> Self {
        let customer = Customer {
            id: CustomerId::from_raw(MOCK_CUSTOMER_ID),
            external_id: None,
            email: None,
            name: None,
        };
        let conversation = Conversation {
            id: ConversationId::from_raw(MOCK_CONVERSATION_ID),
            status: Some("open".into()),
            messages: Vec::new(),
        };
        Self {
            settings: Mutex::new(Script::new(Ok(WidgetSettings::default()))),
            settings_metadata: Mutex::new(Script::new(Ok(()))),
            create_customer: Mutex::new(Script::new(Ok(customer.clone()))),
            update_customer: Mutex::new(Script::new(Ok(customer))),
            external_lookup: Mutex::new(Script::new(Ok(None))),
            valid_customer: Mutex::new(Script::new(Ok(false))),
            create_conversation: Mutex::new(Script::new(Ok(conversation))),
            conversations: Mutex::new(Script::new(Ok(Vec::new()))),
            create_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_settings(self, settings: Result<WidgetSettings, ApiError>) -> Self {
        self.settings.lock().fallback = settings;
        self
    }

    pub fn with_settings_metadata(self, result: Result<(), ApiError>) -> Self {
        self.settings_metadata.lock().fallback = result;
        self
    }

    pub fn with_created_customer(self, result: Result<Customer, ApiError>) -> Self {
        self.create_customer.lock().fallback = result;
        self
    }

    pub fn with_updated_customer(self, result: Result<Customer, ApiError>) -> Self {
        self.update_customer.lock().fallback = result;
        self
    }

    pub fn with_external_lookup(self, result: Result<Option<CustomerId>, ApiError>) -> Self {
        self.external_lookup.lock().fallback = result;
        self
    }

    pub fn with_valid_customer(self, result: Result<bool, ApiError>) -> Self {
        self.valid_customer.lock().fallback = result;
        self
    }

    pub fn with_created_conversation(self, result: Result<Conversation, ApiError>) -> Self {
        self.create_conversation.lock().fallback = result;
        self
    }

    pub fn with_conversations(self, result: Result<Vec<Conversation>, ApiError>) -> Self {
        self.conversations.lock().fallback = result;
        self
    }

    /// Queue one conversation-list response ahead of the fallback.
    pub fn push_conversations(&self, result: Result<Vec<Conversation>, ApiError>) {
        self.conversations.lock().queue.push_back(result);
    }

    /// Replace the conversation-list fallback after construction.
    pub fn set_conversations(&self, result: Result<Vec<Conversation>, ApiError>) {
        self.conversations.lock().fallback = result;
    }

    /// Queue one create-customer response ahead of the fallback.
    pub fn push_created_customer(&self, result: Result<Customer, ApiError>) {
        self.create_customer.lock().queue.push_back(result);
    }

    /// Sleep before answering create calls, to widen race windows.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock() = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().push(call);
    }

    async fn create_pause(&self) {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BackendApi for MockBackendApi {
    async fn fetch_widget_settings(&self, _account_id: &AccountId) -> Result<WidgetSettings, ApiError> {
        self.record(ApiCall::FetchWidgetSettings);
        self.settings.lock().next()
    }

    async fn update_widget_settings_metadata(
        &self,
        _account_id: &AccountId,
        metadata: &serde_json::Value,
    ) -> Result<(), ApiError> {
        self.record(ApiCall::UpdateWidgetSettingsMetadata {
            metadata: metadata.clone(),
        });
        self.settings_metadata.lock().next()
    }

    async fn create_customer(
        &self,
        _account_id: &AccountId,
        metadata: &CustomerMetadata,
    ) -> Result<Customer, ApiError> {
        self.record(ApiCall::CreateCustomer {
            metadata: metadata.clone(),
        });
        self.create_pause().await;
        self.create_customer.lock().next()
    }

    async fn update_customer_metadata(
        &self,
        customer_id: &CustomerId,
        _metadata: &CustomerMetadata,
    ) -> Result<Customer, ApiError> {
        self.record(ApiCall::UpdateCustomerMetadata {
            customer_id: customer_id.clone(),
        });
        self.update_customer.lock().next()
    }

    async fn find_customer_by_external_id(
        &self,
        external_id: &str,
        _account_id: &AccountId,
        filters: &CustomerFilters,
    ) -> Result<Option<CustomerId>, ApiError> {
        self.record(ApiCall::FindCustomerByExternalId {
            external_id: external_id.to_owned(),
            filters: filters.clone(),
        });
        self.external_lookup.lock().next()
    }

    async fn is_valid_customer(
        &self,
        customer_id: &CustomerId,
        _account_id: &AccountId,
    ) -> Result<bool, ApiError> {
        self.record(ApiCall::IsValidCustomer {
            customer_id: customer_id.clone(),
        });
        self.valid_customer.lock().next()
    }

    async fn create_conversation(
        &self,
        _account_id: &AccountId,
        customer_id: &CustomerId,
    ) -> Result<Conversation, ApiError> {
        self.record(ApiCall::CreateConversation {
            customer_id: customer_id.clone(),
        });
        self.create_pause().await;
        self.create_conversation.lock().next()
    }

    async fn fetch_customer_conversations(
        &self,
        customer_id: &CustomerId,
        _account_id: &AccountId,
    ) -> Result<Vec<Conversation>, ApiError> {
        self.record(ApiCall::FetchCustomerConversations {
            customer_id: customer_id.clone(),
        });
        self.conversations.lock().next()
    }
}
