use async_trait::async_trait;

use crate::errors::ApiError;
use crate::ids::{AccountId, CustomerId};
use crate::messages::{Conversation, Customer, CustomerFilters, CustomerMetadata};
use crate::widget::WidgetSettings;

/// Hosted backend used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://app.papercups.io";

/// Request/response calls against the chat backend. Implementations are
/// stateless; the session owns all identity.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_widget_settings(&self, account_id: &AccountId) -> Result<WidgetSettings, ApiError>;

    async fn update_widget_settings_metadata(
        &self,
        account_id: &AccountId,
        metadata: &serde_json::Value,
    ) -> Result<(), ApiError>;

    async fn create_customer(
        &self,
        account_id: &AccountId,
        metadata: &CustomerMetadata,
    ) -> Result<Customer, ApiError>;

    async fn update_customer_metadata(
        &self,
        customer_id: &CustomerId,
        metadata: &CustomerMetadata,
    ) -> Result<Customer, ApiError>;

    /// Look up an existing customer by the embedder's external id.
    async fn find_customer_by_external_id(
        &self,
        external_id: &str,
        account_id: &AccountId,
        filters: &CustomerFilters,
    ) -> Result<Option<CustomerId>, ApiError>;

    async fn is_valid_customer(
        &self,
        customer_id: &CustomerId,
        account_id: &AccountId,
    ) -> Result<bool, ApiError>;

    async fn create_conversation(
        &self,
        account_id: &AccountId,
        customer_id: &CustomerId,
    ) -> Result<Conversation, ApiError>;

    /// Conversations for a customer, most recent first.
    async fn fetch_customer_conversations(
        &self,
        customer_id: &CustomerId,
        account_id: &AccountId,
    ) -> Result<Vec<Conversation>, ApiError>;
}
