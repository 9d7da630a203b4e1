mod diagnostics;

pub use diagnostics::{
    ChatContext, Diagnostic, DiagnosticFilter, DiagnosticLayer, DiagnosticLog, Severity, DEFAULT_RETENTION,
};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for diagnostics output.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `debug` and then by RUST_LOG.
    pub log_level: Level,
    /// Session debug flag. Raises the default level to DEBUG.
    pub debug: bool,
    /// Per-module level overrides (e.g. "parley_realtime" => TRACE).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether to persist warn+ diagnostics to SQLite.
    pub persist_diagnostics: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            debug: false,
            module_levels: Vec::new(),
            json: false,
            persist_diagnostics: true,
            log_db_path: default_log_db_path(),
        }
    }
}

impl TelemetryConfig {
    /// The filter directive string used when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let level = if self.debug { Level::DEBUG } else { self.log_level };
        let mut filter = level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the diagnostic log alive for the lifetime of the process.
pub struct TelemetryGuard {
    diagnostics: Option<Arc<DiagnosticLog>>,
}

impl TelemetryGuard {
    pub fn diagnostics(&self) -> Option<&DiagnosticLog> {
        self.diagnostics.as_deref()
    }
}

/// Initialize tracing. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (diagnostic_layer, diagnostics) = if config.persist_diagnostics {
        match DiagnosticLog::open(&config.log_db_path) {
            Ok(log) => {
                let log = Arc::new(log);
                (Some(DiagnosticLayer::new(log.clone())), Some(log))
            }
            Err(e) => {
                eprintln!("parley-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(diagnostic_layer)
        .init();

    TelemetryGuard { diagnostics }
}

/// `~/.parley/logs.db`, falling back to /tmp when HOME is unset.
pub fn default_log_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
        .join("logs.db")
}
