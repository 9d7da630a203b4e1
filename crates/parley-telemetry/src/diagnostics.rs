//! Warn and error diagnostics persisted to SQLite, tagged with the chat
//! they concern so `parley logs` can narrow by customer or conversation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Rows kept by default; the oldest go first.
pub const DEFAULT_RETENTION: u32 = 5_000;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS diagnostics (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        at_ms           INTEGER NOT NULL,
        severity        TEXT NOT NULL,
        component       TEXT NOT NULL,
        message         TEXT NOT NULL,
        customer_id     TEXT,
        conversation_id TEXT,
        topic           TEXT,
        details         TEXT
    );
    CREATE INDEX IF NOT EXISTS diagnostics_customer ON diagnostics(customer_id, at_ms);
    CREATE INDEX IF NOT EXISTS diagnostics_conversation ON diagnostics(conversation_id, at_ms);
";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    /// Only WARN and ERROR are persisted.
    pub fn from_level(level: &Level) -> Option<Self> {
        if *level == Level::ERROR {
            Some(Self::Error)
        } else if *level == Level::WARN {
            Some(Self::Warn)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// The chat a diagnostic belongs to, gathered from the event and the spans
/// it was emitted in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContext {
    pub customer_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Realtime channel topic.
    pub topic: Option<String>,
}

impl ChatContext {
    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none() && self.conversation_id.is_none() && self.topic.is_none()
    }

    /// Store `value` if `name` is a context field.
    fn set(&mut self, name: &str, value: &str) -> bool {
        let slot = match name {
            "customer_id" => &mut self.customer_id,
            "conversation_id" => &mut self.conversation_id,
            "topic" => &mut self.topic,
            _ => return false,
        };
        *slot = Some(value.trim_matches('"').to_owned());
        true
    }

    /// Fill gaps from an enclosing context.
    fn inherit(&mut self, outer: &ChatContext) {
        if self.customer_id.is_none() {
            self.customer_id.clone_from(&outer.customer_id);
        }
        if self.conversation_id.is_none() {
            self.conversation_id.clone_from(&outer.conversation_id);
        }
        if self.topic.is_none() {
            self.topic.clone_from(&outer.topic);
        }
    }

    /// Values recorded later replace earlier ones.
    fn update(&mut self, newer: ChatContext) {
        if newer.customer_id.is_some() {
            self.customer_id = newer.customer_id;
        }
        if newer.conversation_id.is_some() {
            self.conversation_id = newer.conversation_id;
        }
        if newer.topic.is_some() {
            self.topic = newer.topic;
        }
    }
}

/// One persisted diagnostic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub severity: Severity,
    /// Emitting crate without the `parley_` prefix, e.g. `session`.
    pub component: String,
    pub message: String,
    #[serde(flatten)]
    pub context: ChatContext,
    /// Remaining event fields.
    pub details: Map<String, Value>,
}

/// Which diagnostics to return, newest first.
#[derive(Clone, Debug)]
pub struct DiagnosticFilter {
    pub severity: Option<Severity>,
    pub customer_id: Option<String>,
    pub conversation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for DiagnosticFilter {
    fn default() -> Self {
        Self {
            severity: None,
            customer_id: None,
            conversation_id: None,
            since: None,
            limit: 50,
        }
    }
}

/// Bounded SQLite store of diagnostics.
pub struct DiagnosticLog {
    conn: Mutex<Connection>,
    retention: u32,
}

impl DiagnosticLog {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention: DEFAULT_RETENTION,
        })
    }

    pub fn with_retention(mut self, rows: u32) -> Self {
        self.retention = rows.max(1);
        self
    }

    /// Store `entry` (its `id` is ignored) and drop rows past the retention
    /// window. Returns the new id.
    pub fn append(&self, entry: &Diagnostic) -> Result<i64, rusqlite::Error> {
        let details = if entry.details.is_empty() {
            None
        } else {
            serde_json::to_string(&entry.details).ok()
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO diagnostics
                 (at_ms, severity, component, message, customer_id, conversation_id, topic, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.at.timestamp_millis(),
                entry.severity.as_str(),
                entry.component,
                entry.message,
                entry.context.customer_id,
                entry.context.conversation_id,
                entry.context.topic,
                details,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "DELETE FROM diagnostics WHERE id <= ?1",
            [id - i64::from(self.retention)],
        )?;
        Ok(id)
    }

    pub fn query(&self, filter: &DiagnosticFilter) -> Result<Vec<Diagnostic>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, at_ms, severity, component, message, customer_id, conversation_id, topic, details
             FROM diagnostics
             WHERE (?1 IS NULL OR severity = ?1)
               AND (?2 IS NULL OR customer_id = ?2)
               AND (?3 IS NULL OR conversation_id = ?3)
               AND (?4 IS NULL OR at_ms >= ?4)
             ORDER BY id DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                filter.severity.map(Severity::as_str),
                filter.customer_id,
                filter.conversation_id,
                filter.since.map(|t| t.timestamp_millis()),
                filter.limit,
            ],
            diagnostic_from_row,
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM diagnostics", [], |row| row.get(0))
    }
}

fn diagnostic_from_row(row: &Row<'_>) -> Result<Diagnostic, rusqlite::Error> {
    let at_ms: i64 = row.get(1)?;
    let at = Utc
        .timestamp_millis_opt(at_ms)
        .single()
        .ok_or_else(|| rusqlite::Error::FromSqlConversionFailure(1, Type::Integer, format!("bad timestamp {at_ms}").into()))?;
    let severity: String = row.get(2)?;
    let severity: Severity = severity
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    let details: Option<String> = row.get(8)?;

    Ok(Diagnostic {
        id: row.get(0)?,
        at,
        severity,
        component: row.get(3)?,
        message: row.get(4)?,
        context: ChatContext {
            customer_id: row.get(5)?,
            conversation_id: row.get(6)?,
            topic: row.get(7)?,
        },
        details: details
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or_default(),
    })
}

/// `parley_session::orchestrator` -> `session`.
fn component(target: &str) -> &str {
    let krate = target.split("::").next().unwrap_or(target);
    krate.strip_prefix("parley_").unwrap_or(krate)
}

/// Fields of one event or span, split into message, chat context and the rest.
#[derive(Default)]
struct FieldSplit {
    message: String,
    context: ChatContext,
    details: Map<String, Value>,
}

impl FieldSplit {
    fn text(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else if !self.context.set(field.name(), value) {
            self.details.insert(field.name().to_owned(), Value::from(value));
        }
    }
}

impl Visit for FieldSplit {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.text(field, &format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.details.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.details.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.details.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.details.insert(field.name().to_owned(), Value::from(value));
    }
}

/// tracing layer feeding WARN and ERROR events into a [`DiagnosticLog`].
pub struct DiagnosticLayer {
    log: Arc<DiagnosticLog>,
}

impl DiagnosticLayer {
    pub fn new(log: Arc<DiagnosticLog>) -> Self {
        Self { log }
    }
}

impl<S> Layer<S> for DiagnosticLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = FieldSplit::default();
        attrs.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.context);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut fields = FieldSplit::default();
        values.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<ChatContext>() {
            Some(existing) => existing.update(fields.context),
            None => extensions.insert(fields.context),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(severity) = Severity::from_level(event.metadata().level()) else {
            return;
        };

        let mut fields = FieldSplit::default();
        event.record(&mut fields);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<ChatContext>() {
                    fields.context.inherit(outer);
                }
            }
        }

        let entry = Diagnostic {
            id: 0,
            at: Utc::now(),
            severity,
            component: component(event.metadata().target()).to_owned(),
            message: fields.message,
            context: fields.context,
            details: fields.details,
        };
        // A failing log store has nowhere to report to.
        let _ = self.log.append(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_554_000 + secs, 0).unwrap()
    }

    fn entry(secs: i64, severity: Severity, message: &str, customer: Option<&str>, conversation: Option<&str>) -> Diagnostic {
        Diagnostic {
            id: 0,
            at: at(secs),
            severity,
            component: "session".into(),
            message: message.into(),
            context: ChatContext {
                customer_id: customer.map(String::from),
                conversation_id: conversation.map(String::from),
                topic: None,
            },
            details: Map::new(),
        }
    }

    fn messages(found: &[Diagnostic]) -> Vec<&str> {
        found.iter().map(|d| d.message.as_str()).collect()
    }

    #[test]
    fn filters_by_chat_and_severity() {
        let log = DiagnosticLog::in_memory().unwrap();
        log.append(&entry(0, Severity::Warn, "lobby join failed", Some("cust-a"), None)).unwrap();
        log.append(&entry(1, Severity::Error, "push failed", Some("cust-a"), Some("conv-1"))).unwrap();
        log.append(&entry(2, Severity::Warn, "other customer", Some("cust-b"), None)).unwrap();

        let for_a = log
            .query(&DiagnosticFilter {
                customer_id: Some("cust-a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&for_a), vec!["push failed", "lobby join failed"]);

        let errors = log
            .query(&DiagnosticFilter {
                severity: Some(Severity::Error),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&errors), vec!["push failed"]);

        let conv = log
            .query(&DiagnosticFilter {
                conversation_id: Some("conv-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(conv.len(), 1);
        assert_eq!(conv[0].at, at(1));
        assert_eq!(conv[0].severity, Severity::Error);
    }

    #[test]
    fn since_and_limit() {
        let log = DiagnosticLog::in_memory().unwrap();
        for i in 0..10 {
            log.append(&entry(i, Severity::Warn, &format!("msg {i}"), None, None)).unwrap();
        }

        let newest = log
            .query(&DiagnosticFilter {
                limit: 3,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&newest), vec!["msg 9", "msg 8", "msg 7"]);

        let recent = log
            .query(&DiagnosticFilter {
                since: Some(at(8)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&recent), vec!["msg 9", "msg 8"]);
    }

    #[test]
    fn retention_drops_oldest() {
        let log = DiagnosticLog::in_memory().unwrap().with_retention(3);
        for i in 0..5 {
            log.append(&entry(i, Severity::Warn, &format!("msg {i}"), None, None)).unwrap();
        }
        assert_eq!(log.count().unwrap(), 3);
        let kept = log.query(&DiagnosticFilter::default()).unwrap();
        assert_eq!(messages(&kept), vec!["msg 4", "msg 3", "msg 2"]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("logs.db");
        DiagnosticLog::open(&path)
            .unwrap()
            .append(&entry(0, Severity::Error, "kept", None, None))
            .unwrap();

        let log = DiagnosticLog::open(&path).unwrap();
        assert_eq!(messages(&log.query(&DiagnosticFilter::default()).unwrap()), vec!["kept"]);
    }

    #[test]
    fn layer_tags_events_with_chat_context() {
        let log = Arc::new(DiagnosticLog::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(DiagnosticLayer::new(log.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("session", customer_id = "cust-1");
            let _enter = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(
                target: "parley_session::orchestrator",
                conversation_id = "conv-1",
                topic = "conversation:conv-1",
                attempts = 3u64,
                "join failed"
            );
        });

        let found = log.query(&DiagnosticFilter::default()).unwrap();
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.severity, Severity::Warn);
        assert_eq!(d.component, "session");
        assert_eq!(d.message, "join failed");
        assert_eq!(d.context.customer_id.as_deref(), Some("cust-1"));
        assert_eq!(d.context.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(d.context.topic.as_deref(), Some("conversation:conv-1"));
        assert_eq!(d.details.get("attempts"), Some(&Value::from(3u64)));
    }

    #[test]
    fn ids_recorded_after_span_creation_are_used() {
        let log = Arc::new(DiagnosticLog::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(DiagnosticLayer::new(log.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("send", customer_id = tracing::field::Empty);
            span.record("customer_id", "cust-late");
            let _enter = span.enter();
            tracing::error!("push failed");
        });

        let found = log.query(&DiagnosticFilter::default()).unwrap();
        assert_eq!(found[0].context.customer_id.as_deref(), Some("cust-late"));
        assert_eq!(found[0].severity, Severity::Error);
        assert_eq!(found[0].component, "telemetry");
    }

    #[test]
    fn severity_parsing() {
        assert_eq!("WARNING".parse::<Severity>(), Ok(Severity::Warn));
        assert_eq!("error".parse::<Severity>(), Ok(Severity::Error));
        assert!("info".parse::<Severity>().is_err());
        assert_eq!(format!("{:5}|", Severity::Warn), "warn |");
    }
}
