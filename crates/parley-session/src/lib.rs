//! Chat session orchestration: identity resolution, channel lifecycle,
//! optimistic sends and reconciliation of server-confirmed messages.

pub mod backoff;
pub mod config;
pub mod error;
pub mod greeting;
pub mod orchestrator;
pub mod reconcile;
pub mod settings;

pub use backoff::BackoffConfig;
pub use config::{SessionCallbacks, SessionConfig};
pub use error::{SessionError, SettingsError};
pub use greeting::{GreetingConfig, GreetingGenerator};
pub use orchestrator::SessionOrchestrator;
pub use settings::ClientSettings;
