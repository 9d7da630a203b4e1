use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use parley_core::api::BackendApi;
pub use parley_core::api::DEFAULT_BASE_URL;
use parley_core::errors::ApiError;
use parley_core::ids::{AccountId, CustomerId};
use parley_core::messages::{Conversation, Customer, CustomerFilters, CustomerMetadata};
use parley_core::widget::WidgetSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// All backend responses wrap their payload in `{"data": ...}`.
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct IdentifyResult {
    #[serde(default)]
    customer_id: Option<CustomerId>,
}

/// JSON-over-HTTP binding of [`BackendApi`].
pub struct HttpBackendApi {
    client: Client,
    base_url: String,
}

impl HttpBackendApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(format!("build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_raw(&self, req: reqwest::RequestBuilder) -> Result<String, ApiError> {
        let resp = req.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        Ok(body)
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ApiError> {
        let body = self.send_raw(req).await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(REQUEST_TIMEOUT)
    } else {
        ApiError::Network(e.to_string())
    }
}

/// Body for `POST /api/customers`: the identify record plus first-seen
/// bookkeeping.
fn new_customer_params(account_id: &AccountId, metadata: &CustomerMetadata) -> serde_json::Value {
    let now = Utc::now();
    let mut customer = match serde_json::to_value(metadata) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let _ = customer.insert("account_id".into(), json!(account_id));
    let _ = customer.insert("first_seen".into(), json!(now.format("%Y-%m-%d").to_string()));
    let _ = customer.insert(
        "last_seen_at".into(),
        json!(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    json!({ "customer": customer })
}

#[async_trait]
impl BackendApi for HttpBackendApi {
    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn fetch_widget_settings(&self, account_id: &AccountId) -> Result<WidgetSettings, ApiError> {
        let req = self
            .client
            .get(self.url("/api/widget_settings"))
            .query(&[("account_id", account_id.as_str())]);
        let settings: Option<WidgetSettings> = self.send(req).await?;
        Ok(settings.unwrap_or_default())
    }

    #[instrument(skip(self, metadata), fields(account_id = %account_id))]
    async fn update_widget_settings_metadata(
        &self,
        account_id: &AccountId,
        metadata: &serde_json::Value,
    ) -> Result<(), ApiError> {
        let req = self
            .client
            .put(self.url("/api/widget_settings/metadata"))
            .json(&json!({ "account_id": account_id, "metadata": metadata }));
        let _ = self.send_raw(req).await?;
        Ok(())
    }

    #[instrument(skip(self, metadata), fields(account_id = %account_id))]
    async fn create_customer(
        &self,
        account_id: &AccountId,
        metadata: &CustomerMetadata,
    ) -> Result<Customer, ApiError> {
        let req = self
            .client
            .post(self.url("/api/customers"))
            .json(&new_customer_params(account_id, metadata));
        let customer: Customer = self.send(req).await?;
        debug!(customer_id = %customer.id, "customer created");
        Ok(customer)
    }

    #[instrument(skip(self, metadata), fields(customer_id = %customer_id))]
    async fn update_customer_metadata(
        &self,
        customer_id: &CustomerId,
        metadata: &CustomerMetadata,
    ) -> Result<Customer, ApiError> {
        let req = self
            .client
            .put(self.url(&format!("/api/customers/{customer_id}/metadata")))
            .json(&json!({ "metadata": metadata }));
        self.send(req).await
    }

    #[instrument(skip(self, filters), fields(account_id = %account_id))]
    async fn find_customer_by_external_id(
        &self,
        external_id: &str,
        account_id: &AccountId,
        filters: &CustomerFilters,
    ) -> Result<Option<CustomerId>, ApiError> {
        let mut query = vec![("external_id", external_id), ("account_id", account_id.as_str())];
        if let Some(email) = filters.email.as_deref() {
            query.push(("email", email));
        }
        if let Some(host) = filters.host.as_deref() {
            query.push(("host", host));
        }
        let req = self
            .client
            .get(self.url("/api/customers/identify"))
            .query(&query);
        let result: Option<IdentifyResult> = self.send(req).await?;
        Ok(result.and_then(|r| r.customer_id))
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn is_valid_customer(
        &self,
        customer_id: &CustomerId,
        account_id: &AccountId,
    ) -> Result<bool, ApiError> {
        let req = self
            .client
            .get(self.url(&format!("/api/customers/{customer_id}/exists")))
            .query(&[("account_id", account_id.as_str())]);
        self.send(req).await
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn create_conversation(
        &self,
        account_id: &AccountId,
        customer_id: &CustomerId,
    ) -> Result<Conversation, ApiError> {
        let req = self
            .client
            .post(self.url("/api/conversations"))
            .json(&json!({
                "conversation": { "account_id": account_id, "customer_id": customer_id }
            }));
        self.send(req).await
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn fetch_customer_conversations(
        &self,
        customer_id: &CustomerId,
        account_id: &AccountId,
    ) -> Result<Vec<Conversation>, ApiError> {
        let req = self
            .client
            .get(self.url("/api/conversations/customer"))
            .query(&[
                ("customer_id", customer_id.as_str()),
                ("account_id", account_id.as_str()),
            ]);
        let conversations: Option<Vec<Conversation>> = self.send(req).await?;
        Ok(conversations.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CUSTOMER: &str = "11111111-1111-1111-1111-111111111111";

    fn account() -> AccountId {
        AccountId::from_raw("acc-1")
    }

    async fn api(server: &MockServer) -> HttpBackendApi {
        HttpBackendApi::new(format!("{}/", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn fetch_widget_settings_unwraps_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/widget_settings"))
            .and(query_param("account_id", "acc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "greeting": "Hello!",
                    "away_message": "We're out",
                    "account": {"is_outside_working_hours": true}
                }
            })))
            .mount(&server)
            .await;

        let settings = api(&server).await.fetch_widget_settings(&account()).await.unwrap();
        assert_eq!(settings.greeting.as_deref(), Some("Hello!"));
        assert!(settings.is_outside_working_hours());
    }

    #[tokio::test]
    async fn null_settings_become_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/widget_settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": null })))
            .mount(&server)
            .await;

        let settings = api(&server).await.fetch_widget_settings(&account()).await.unwrap();
        assert!(settings.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/widget_settings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = api(&server).await.fetch_widget_settings(&account()).await.unwrap_err();
        assert!(matches!(err, ApiError::ServerError { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/api/customers/{CUSTOMER}/exists")))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = api(&server)
            .await
            .is_valid_customer(&CustomerId::from_raw(CUSTOMER), &account())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "decode_error");
    }

    #[tokio::test]
    async fn create_customer_posts_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/customers"))
            .and(body_partial_json(json!({
                "customer": {"account_id": "acc-1", "email": "a@b.co", "external_id": "ext-9"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"id": CUSTOMER, "email": "a@b.co"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = CustomerMetadata {
            email: Some("a@b.co".into()),
            external_id: Some("ext-9".into()),
            ..Default::default()
        };
        let customer = api(&server).await.create_customer(&account(), &metadata).await.unwrap();
        assert_eq!(customer.id.as_str(), CUSTOMER);
    }

    #[tokio::test]
    async fn update_customer_metadata_puts_to_customer_path() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("/api/customers/{CUSTOMER}/metadata")))
            .and(body_partial_json(json!({"metadata": {"name": "Ada"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": CUSTOMER, "name": "Ada"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = CustomerMetadata {
            name: Some("Ada".into()),
            ..Default::default()
        };
        let customer = api(&server)
            .await
            .update_customer_metadata(&CustomerId::from_raw(CUSTOMER), &metadata)
            .await
            .unwrap();
        assert_eq!(customer.name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn identify_passes_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/customers/identify"))
            .and(query_param("external_id", "ext-9"))
            .and(query_param("email", "a@b.co"))
            .and(query_param("host", "example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"customer_id": CUSTOMER}
            })))
            .mount(&server)
            .await;

        let filters = CustomerFilters {
            email: Some("a@b.co".into()),
            host: Some("example.com".into()),
        };
        let found = api(&server)
            .await
            .find_customer_by_external_id("ext-9", &account(), &filters)
            .await
            .unwrap();
        assert_eq!(found, Some(CustomerId::from_raw(CUSTOMER)));
    }

    #[tokio::test]
    async fn identify_without_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/customers/identify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"customer_id": null}
            })))
            .mount(&server)
            .await;

        let found = api(&server)
            .await
            .find_customer_by_external_id("ext-9", &account(), &CustomerFilters::default())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn conversations_for_customer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations/customer"))
            .and(query_param("customer_id", CUSTOMER))
            .and(query_param("account_id", "acc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "conv-2",
                    "status": "open",
                    "messages": [
                        {"body": "second", "type": "agent", "created_at": "2021-01-01T00:00:02"},
                        {"body": "first", "type": "customer", "created_at": "2021-01-01T00:00:01"}
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let conversations = api(&server)
            .await
            .fetch_customer_conversations(&CustomerId::from_raw(CUSTOMER), &account())
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id.as_str(), "conv-2");
        assert_eq!(conversations[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn create_conversation_without_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/conversations"))
            .and(body_partial_json(json!({
                "conversation": {"account_id": "acc-1", "customer_id": CUSTOMER}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"id": "conv-1"}
            })))
            .mount(&server)
            .await;

        let conversation = api(&server)
            .await
            .create_conversation(&account(), &CustomerId::from_raw(CUSTOMER))
            .await
            .unwrap();
        assert_eq!(conversation.id.as_str(), "conv-1");
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn widget_metadata_update_ignores_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/widget_settings/metadata"))
            .and(body_partial_json(json!({"account_id": "acc-1", "metadata": {"host": "example.com"}})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        api(&server)
            .await
            .update_widget_settings_metadata(&account(), &json!({"host": "example.com"}))
            .await
            .unwrap();
    }

    #[test]
    fn new_customer_params_shape() {
        let metadata = CustomerMetadata {
            name: Some("Ada".into()),
            ..Default::default()
        };
        let params = new_customer_params(&account(), &metadata);
        let customer = &params["customer"];
        assert_eq!(customer["account_id"], "acc-1");
        assert_eq!(customer["name"], "Ada");
        assert!(customer["first_seen"].is_string());
        assert!(customer["last_seen_at"].is_string());
        assert!(customer.get("email").is_none());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let api = HttpBackendApi::new("https://chat.example.com/").unwrap();
        assert_eq!(api.base_url(), "https://chat.example.com");
        assert_eq!(api.url("/api/x"), "https://chat.example.com/api/x");
    }
}
