use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use parley_core::messages::Message;
use parley_core::widget::WidgetSettings;

/// Custom initial-message generator. Receives the applied widget settings
/// and the time the greeting is pinned to.
pub type GreetingGenerator = Arc<dyn Fn(&WidgetSettings, DateTime<Utc>) -> Vec<Message> + Send + Sync>;

/// Greeting overrides supplied by the embedder. Non-empty values win over
/// the fetched widget settings.
#[derive(Clone, Default)]
pub struct GreetingConfig {
    pub greeting: Option<String>,
    pub away_message: Option<String>,
    pub generator: Option<GreetingGenerator>,
}

impl fmt::Debug for GreetingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreetingConfig")
            .field("greeting", &self.greeting)
            .field("away_message", &self.away_message)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

/// The default transcript shown before (or above) the real conversation.
///
/// Returns at most one bot message stamped `at`, or whatever a configured
/// generator returns.
pub fn default_messages(config: &GreetingConfig, settings: &WidgetSettings, at: DateTime<Utc>) -> Vec<Message> {
    if let Some(generator) = &config.generator {
        return generator(settings, at);
    }

    let greeting = non_empty(config.greeting.as_deref()).or(non_empty(settings.greeting.as_deref()));
    let away_message =
        non_empty(config.away_message.as_deref()).or(non_empty(settings.away_message.as_deref()));

    let text = match (greeting, away_message) {
        (None, None) => return Vec::new(),
        (_, Some(away)) if settings.is_outside_working_hours() => Some(away),
        (greeting, _) => greeting,
    };

    match text {
        Some(text) => vec![Message::bot(text, at)],
        None => Vec::new(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}
