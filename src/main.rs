//! # parley
//!
//! Terminal chat client: runs a session against a chat backend, prints the
//! conversation and sends each line typed on stdin.

#![deny(unsafe_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use parley_api::HttpBackendApi;
use parley_core::events::SessionEvent;
use parley_core::messages::{Message, MessageType};
use parley_realtime::{PhoenixSocket, SocketConfig};
use parley_session::settings::{load_settings_from_path, settings_path};
use parley_session::{ClientSettings, SessionOrchestrator};
use parley_store::{Database, SqliteIdentityCache};
use parley_telemetry::{init_telemetry, Diagnostic, DiagnosticFilter, DiagnosticLog, Severity, TelemetryConfig};

/// Live chat from the terminal.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Embeddable live-chat client")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a chat session.
    Chat(ChatArgs),
    /// Show persisted warnings and errors.
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long)]
    account: Option<String>,
    #[arg(long)]
    customer_id: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    websocket_url: Option<String>,
    #[arg(long)]
    external_id: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Verbose diagnostics.
    #[arg(long)]
    debug: bool,
    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Args, Debug)]
struct LogsArgs {
    /// `warn` or `error`.
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    customer_id: Option<String>,
    #[arg(long)]
    conversation_id: Option<String>,
    /// Only records at or after this RFC 3339 timestamp.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long, default_value = "50")]
    limit: u32,
}

impl ChatArgs {
    /// Flags win over the file and environment.
    fn apply(self, settings: &mut ClientSettings) {
        if let Some(v) = self.account {
            settings.account_id = v;
        }
        if let Some(v) = self.customer_id {
            settings.customer_id = Some(v);
        }
        if let Some(v) = self.base_url {
            settings.base_url = v;
        }
        if let Some(v) = self.websocket_url {
            settings.websocket_url = Some(v);
        }
        if self.external_id.is_some() || self.email.is_some() || self.name.is_some() {
            let customer = settings.customer.get_or_insert_with(Default::default);
            if let Some(v) = self.external_id {
                customer.external_id = Some(v);
            }
            if let Some(v) = self.email {
                customer.email = Some(v);
            }
            if let Some(v) = self.name {
                customer.name = Some(v);
            }
        }
        if self.debug {
            settings.debug = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.settings.unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    match cli.command {
        Command::Chat(args) => {
            let json_logs = args.json_logs;
            args.apply(&mut settings);
            run_chat(settings, json_logs).await
        }
        Command::Logs(args) => show_logs(&settings, args),
    }
}

async fn run_chat(settings: ClientSettings, json_logs: bool) -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig {
        debug: settings.debug,
        json: json_logs,
        log_db_path: settings.log_db_path(),
        ..Default::default()
    });

    let config = settings.session_config()?;
    let api = HttpBackendApi::new(&settings.base_url)?;
    let socket = PhoenixSocket::new(SocketConfig::new(settings.websocket_url()));
    let db_path = settings.identity_db_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open identity database: {}", db_path.display()))?;
    let cache = SqliteIdentityCache::for_account(db, &config.account_id);

    info!(account_id = %config.account_id, base_url = %settings.base_url, "starting chat session");
    let session = SessionOrchestrator::new(config, Arc::new(api), Arc::new(socket), Arc::new(cache));

    let printer = tokio::spawn(print_events(session.subscribe()));

    match session.start().await {
        Some(conversation) => info!(conversation_id = %conversation.id, "resumed conversation"),
        None => info!("no conversation yet, one is created on first message"),
    }
    for message in session.messages() {
        print_message(&message);
    }

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    chat_loop(&session, BufReader::new(tokio::io::stdin()), ctrl_c).await?;

    session.disconnect().await;
    printer.abort();
    Ok(())
}

/// Send each input line until EOF or `shutdown` resolves. A send still in
/// flight is abandoned on shutdown.
async fn chat_loop<R, S>(session: &SessionOrchestrator, input: R, shutdown: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else { break };

        tokio::select! {
            result = session.send_message(Some(line), Vec::new()) => {
                if let Err(e) = result {
                    warn!(error = %e, "message not sent");
                    eprintln!("message not sent: {e}");
                }
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageCreated { message }) => print_message(&message),
            Ok(SessionEvent::ConversationCreated { conversation_id, .. }) => {
                println!("-- conversation {conversation_id} started");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "transcript printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &Message) {
    let who = match message.message_type {
        MessageType::Customer => "you",
        MessageType::Agent => "agent",
        MessageType::Bot => "bot",
    };
    let attachments = match message.file_ids.len() {
        0 => String::new(),
        n => format!(" [{n} attachment(s)]"),
    };
    println!("[{who}] {}{attachments}", message.text());
}

fn show_logs(settings: &ClientSettings, args: LogsArgs) -> Result<()> {
    let path = settings.log_db_path();
    let log = DiagnosticLog::open(&path)
        .with_context(|| format!("Failed to open log database: {}", path.display()))?;
    let found = log.query(&DiagnosticFilter {
        severity: args.severity,
        customer_id: args.customer_id,
        conversation_id: args.conversation_id,
        since: args.since,
        limit: args.limit,
    })?;

    if found.is_empty() {
        println!("no persisted diagnostics");
    }
    for d in &found {
        println!("{}", format_diagnostic(d));
    }
    Ok(())
}

fn format_diagnostic(d: &Diagnostic) -> String {
    let mut line = format!(
        "{} {:5} [{}] {}",
        d.at.format("%Y-%m-%d %H:%M:%S%.3f"),
        d.severity,
        d.component,
        d.message
    );
    let context = [
        ("customer", &d.context.customer_id),
        ("conversation", &d.context.conversation_id),
        ("topic", &d.context.topic),
    ];
    for (label, value) in context {
        if let Some(value) = value {
            line.push_str(&format!(" {label}={value}"));
        }
    }
    line
}
