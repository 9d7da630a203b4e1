use thiserror::Error;

use parley_core::errors::{ApiError, TransportError};
use parley_store::StoreError;

/// Failures surfaced by session operations. Startup never returns one;
/// it degrades instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend: {0}")]
    Api(#[from] ApiError),
    #[error("realtime: {0}")]
    Transport(#[from] TransportError),
    #[error("identity cache: {0}")]
    Store(#[from] StoreError),
    #[error("session has been disconnected")]
    Disconnected,
}

/// Errors that can occur when loading client settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_converts() {
        let err: SessionError = ApiError::NotFound("customer".into()).into();
        assert!(matches!(err, SessionError::Api(ApiError::NotFound(_))));
        assert_eq!(err.to_string(), "backend: not found: customer");
    }

    #[test]
    fn transport_error_converts() {
        let err: SessionError = TransportError::NotConnected.into();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[test]
    fn settings_json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(err.to_string().contains("parse settings JSON"));
    }
}
