use std::time::Duration;

/// Typed errors for backend API calls.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Decode(_) => "decode_error",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            400 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Errors raised by a realtime transport or one of its channels.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("join of {topic} refused: {reason}")]
    JoinRefused { topic: String, reason: String },
    #[error("{event} on {topic} timed out")]
    Timeout { topic: String, event: String },
    #[error("push of {event} on {topic} failed: {reason}")]
    Push {
        topic: String,
        event: String,
        reason: String,
    },
    #[error("socket closed")]
    Closed,
    #[error("encode error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ApiError::RateLimited { retry_after: None }.is_retryable());
        assert!(ApiError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::Timeout(Duration::from_secs(10)).is_retryable());
    }

    #[test]
    fn not_retryable() {
        assert!(!ApiError::Unauthorized("no".into()).is_retryable());
        assert!(!ApiError::NotFound("customer".into()).is_retryable());
        assert!(!ApiError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(ApiError::from_status(401, String::new()), ApiError::Unauthorized(_)));
        assert!(matches!(ApiError::from_status(404, String::new()), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from_status(422, String::new()), ApiError::InvalidRequest(_)));
        assert!(matches!(ApiError::from_status(429, String::new()), ApiError::RateLimited { .. }));
        assert!(matches!(
            ApiError::from_status(503, "down".into()),
            ApiError::ServerError { status: 503, .. }
        ));
        assert!(matches!(ApiError::from_status(302, String::new()), ApiError::InvalidRequest(_)));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ApiError::Decode("x".into()).error_kind(), "decode_error");
        assert_eq!(ApiError::Network("x".into()).error_kind(), "network_error");
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::JoinRefused {
            topic: "room:1".into(),
            reason: "unauthorized".into(),
        };
        assert_eq!(err.to_string(), "join of room:1 refused: unauthorized");
    }
}
