//! Client settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.parley/settings.json` exists, deep-merge it over the defaults
//! 3. Apply `PARLEY_*` environment variable overrides
//!
//! Command-line flags are applied by the binary on top of the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use parley_core::api::DEFAULT_BASE_URL;
use parley_core::ids::AccountId;
use parley_core::messages::CustomerMetadata;

use crate::backoff::BackoffConfig;
use crate::config::SessionConfig;
use crate::error::SettingsError;
use crate::greeting::GreetingConfig;

const SOCKET_PATH: &str = "/socket/websocket";

/// Everything needed to run a chat session from the command line or an
/// embedding host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub account_id: String,
    pub customer_id: Option<String>,
    pub customer: Option<CustomerMetadata>,
    pub base_url: String,
    /// Explicit websocket endpoint. Derived from `base_url` when absent.
    pub websocket_url: Option<String>,
    pub debug: bool,
    pub greeting: Option<String>,
    pub away_message: Option<String>,
    pub identity_db_path: Option<PathBuf>,
    pub log_db_path: Option<PathBuf>,
    pub backoff: BackoffSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            customer_id: None,
            customer: None,
            base_url: DEFAULT_BASE_URL.to_owned(),
            websocket_url: None,
            debug: false,
            greeting: None,
            away_message: None,
            identity_db_path: None,
            log_db_path: None,
            backoff: BackoffSettings::default(),
        }
    }
}

/// Serializable form of [`BackoffConfig`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let config = BackoffConfig::default();
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(s: &BackoffSettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter_factor: s.jitter_factor,
        }
    }
}

impl ClientSettings {
    /// Websocket endpoint: the explicit override, or `base_url` with its
    /// scheme switched to `ws`/`wss`.
    pub fn websocket_url(&self) -> String {
        match self.websocket_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_owned(),
            _ => derive_websocket_url(&self.base_url),
        }
    }

    pub fn identity_db_path(&self) -> PathBuf {
        self.identity_db_path
            .clone()
            .unwrap_or_else(|| parley_dir().join("identity.db"))
    }

    pub fn log_db_path(&self) -> PathBuf {
        self.log_db_path
            .clone()
            .unwrap_or_else(|| parley_dir().join("logs.db"))
    }

    pub fn session_config(&self) -> Result<SessionConfig, SettingsError> {
        let account_id = self.account_id.trim();
        if account_id.is_empty() {
            return Err(SettingsError::InvalidValue("accountId is required".into()));
        }
        if self.backoff.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "backoff.maxAttempts must be at least 1".into(),
            ));
        }

        let mut config = SessionConfig::new(AccountId::from_raw(account_id));
        config.customer_id = self.customer_id.clone();
        config.customer = self.customer.clone();
        config.greeting = GreetingConfig {
            greeting: self.greeting.clone(),
            away_message: self.away_message.clone(),
            generator: None,
        };
        config.backoff = BackoffConfig::from(&self.backoff);
        Ok(config)
    }
}

fn derive_websocket_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let host = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{base}")
    };
    format!("{host}{SOCKET_PATH}")
}

fn parley_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

/// Resolve the path to the settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    parley_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings, SettingsError> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<ClientSettings, SettingsError> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` environment variable overrides.
///
/// Empty values are ignored; invalid booleans are logged and ignored.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = string("PARLEY_ACCOUNT_ID") {
        settings.account_id = v;
    }
    if let Some(v) = string("PARLEY_CUSTOMER_ID") {
        settings.customer_id = Some(v);
    }
    if let Some(v) = string("PARLEY_BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = string("PARLEY_GREETING") {
        settings.greeting = Some(v);
    }
    if let Some(v) = string("PARLEY_AWAY_MESSAGE") {
        settings.away_message = Some(v);
    }
    if let Some(raw) = lookup("PARLEY_DEBUG") {
        match parse_bool(&raw) {
            Some(v) => settings.debug = v,
            None => warn!(key = "PARLEY_DEBUG", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a boolean from common spellings: `true`/`1`/`yes`/`on` and
/// `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
