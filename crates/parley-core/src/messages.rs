use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, ClientToken, ConversationId, CustomerId, MessageId};

/// Who authored a message.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Customer,
    #[default]
    Agent,
    Bot,
}

/// A transcript entry. A message without `created_at` is pending (sent
/// optimistically, not yet confirmed by the backend).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<CustomerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<ClientToken>,
}

impl Message {
    /// Optimistic customer message. `sent_at` is truncated to milliseconds so
    /// it survives a round trip through the backend unchanged.
    pub fn customer(
        body: Option<String>,
        file_ids: Vec<String>,
        customer_id: Option<CustomerId>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            body,
            file_ids,
            message_type: MessageType::Customer,
            customer_id,
            conversation_id: None,
            account_id: None,
            user_id: None,
            sent_at: Some(truncate_millis(sent_at)),
            created_at: None,
            seen_at: None,
            client_token: Some(ClientToken::new()),
        }
    }

    /// Synthetic bot message shown before (or above) the real conversation.
    pub fn bot(body: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            body: Some(body.into()),
            file_ids: Vec::new(),
            message_type: MessageType::Bot,
            customer_id: Some(CustomerId::bot()),
            conversation_id: None,
            account_id: None,
            user_id: None,
            sent_at: None,
            created_at: Some(at),
            seen_at: Some(at),
            client_token: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.created_at.is_none()
    }

    pub fn is_confirmed(&self) -> bool {
        self.created_at.is_some()
    }

    /// Body text, or `""` when absent.
    pub fn text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    /// True when the body is absent or whitespace only.
    pub fn has_empty_body(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// Truncate to millisecond precision, the resolution send timestamps are
/// compared at.
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// A backend conversation with (possibly unsorted) messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A backend customer record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Identify record supplied by the embedding page.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl CustomerMetadata {
    /// External id, ignoring empty strings.
    pub fn external_id(&self) -> Option<&str> {
        non_empty(&self.external_id)
    }

    pub fn email(&self) -> Option<&str> {
        non_empty(&self.email)
    }

    pub fn host(&self) -> Option<&str> {
        non_empty(&self.host)
    }

    /// Page location fields reported to widget settings, or `None` if the
    /// embedder supplied none of them.
    pub fn location(&self) -> Option<serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (key, value) in [
            ("host", &self.host),
            ("pathname", &self.pathname),
            ("current_url", &self.current_url),
        ] {
            if let Some(v) = non_empty(value) {
                let _ = map.insert(key.to_owned(), serde_json::Value::String(v.to_owned()));
            }
        }
        (!map.is_empty()).then_some(serde_json::Value::Object(map))
    }
}

/// Disambiguating filters for an external-id lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomerFilters {
    pub email: Option<String>,
    pub host: Option<String>,
}

impl From<&CustomerMetadata> for CustomerFilters {
    fn from(metadata: &CustomerMetadata) -> Self {
        Self {
            email: metadata.email().map(str::to_owned),
            host: metadata.host().map(str::to_owned),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// Serde adapter for optional UTC timestamps. Writes RFC 3339 with
/// millisecond precision; reads RFC 3339 or naive ISO 8601 (assumed UTC),
/// which is how the backend renders `inserted_at`-style columns.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse(s).map(Some).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid timestamp: {s}"))
            }),
        }
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(at) = DateTime::parse_from_rfc3339(s) {
            return Some(at.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn customer_message_is_pending() {
        let msg = Message::customer(Some("hi".into()), vec![], None, Utc::now());
        assert!(msg.is_pending());
        assert_eq!(msg.message_type, MessageType::Customer);
        assert!(msg.client_token.is_some());
    }

    #[test]
    fn customer_message_truncates_sent_at() {
        let sent = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let msg = Message::customer(Some("hi".into()), vec![], None, sent);
        assert_eq!(msg.sent_at.unwrap().timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn bot_message_is_confirmed_and_seen() {
        let msg = Message::bot("Hello!", at(100));
        assert!(msg.is_confirmed());
        assert_eq!(msg.seen_at, Some(at(100)));
        assert_eq!(msg.customer_id, Some(CustomerId::bot()));
        assert_eq!(msg.message_type, MessageType::Bot);
    }

    #[test]
    fn empty_body_detection() {
        let mut msg = Message::bot("  ", at(0));
        assert!(msg.has_empty_body());
        msg.body = None;
        assert!(msg.has_empty_body());
        assert_eq!(msg.text(), "");
    }

    #[test]
    fn message_wire_names() {
        let msg = Message::customer(Some("hi".into()), vec!["f1".into()], None, at(5));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "customer");
        assert_eq!(json["body"], "hi");
        assert_eq!(json["file_ids"][0], "f1");
        assert_eq!(json["sent_at"], "1970-01-01T00:00:05.000Z");
        assert!(json.get("created_at").is_none());
    }

    #[test]
    fn deserialize_server_message_with_naive_timestamps() {
        let json = serde_json::json!({
            "id": "m1",
            "body": "hello from support",
            "type": "agent",
            "user_id": 7,
            "created_at": "2021-03-04T05:06:07.123456",
            "sent_at": null
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert!(msg.is_confirmed());
        assert_eq!(msg.message_type, MessageType::Agent);
        assert_eq!(msg.user_id, Some(7));
        assert!(msg.sent_at.is_none());
        assert_eq!(msg.created_at.unwrap().timestamp(), 1_614_834_367);
    }

    #[test]
    fn missing_type_defaults_to_agent() {
        let msg: Message = serde_json::from_value(serde_json::json!({"body": "x"})).unwrap();
        assert_eq!(msg.message_type, MessageType::Agent);
        assert!(msg.file_ids.is_empty());
    }

    #[test]
    fn invalid_timestamp_is_an_error() {
        let res: Result<Message, _> =
            serde_json::from_value(serde_json::json!({"created_at": "yesterday"}));
        assert!(res.is_err());
    }

    #[test]
    fn metadata_location_only_includes_present_fields() {
        let meta = CustomerMetadata {
            host: Some("example.com".into()),
            pathname: Some("".into()),
            ..Default::default()
        };
        let loc = meta.location().unwrap();
        assert_eq!(loc, serde_json::json!({"host": "example.com"}));
        assert!(CustomerMetadata::default().location().is_none());
    }

    #[test]
    fn metadata_ignores_empty_external_id() {
        let meta = CustomerMetadata {
            external_id: Some(" ".into()),
            email: Some("a@b.c".into()),
            ..Default::default()
        };
        assert!(meta.external_id().is_none());
        let filters = CustomerFilters::from(&meta);
        assert_eq!(filters.email.as_deref(), Some("a@b.c"));
        assert!(filters.host.is_none());
    }

    #[test]
    fn conversation_defaults_messages() {
        let conv: Conversation =
            serde_json::from_value(serde_json::json!({"id": "c1"})).unwrap();
        assert!(conv.messages.is_empty());
    }
}
