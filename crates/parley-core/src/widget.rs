use serde::{Deserialize, Serialize};

/// Widget configuration fetched from the backend. Every field is optional;
/// an absent field means "no override".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Account-level status embedded in widget settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_outside_working_hours: Option<bool>,
}

impl WidgetSettings {
    pub fn is_outside_working_hours(&self) -> bool {
        self.account
            .as_ref()
            .and_then(|a| a.is_outside_working_hours)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_from_empty_object() {
        let settings: WidgetSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.is_empty());
        assert!(!settings.is_outside_working_hours());
    }

    #[test]
    fn outside_working_hours_read_from_account() {
        let settings: WidgetSettings = serde_json::from_value(serde_json::json!({
            "greeting": "Hi there",
            "away_message": "We're away",
            "account": {"company_name": "Acme", "is_outside_working_hours": true}
        }))
        .unwrap();
        assert!(settings.is_outside_working_hours());
        assert_eq!(settings.greeting.as_deref(), Some("Hi there"));
        assert!(!settings.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let settings: WidgetSettings = serde_json::from_value(serde_json::json!({
            "color": "#1890ff",
            "account": {"working_hours": []}
        }))
        .unwrap();
        assert!(!settings.is_outside_working_hours());
    }
}
