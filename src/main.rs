use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use conductor_core::content::Content;
use conductor_core::event::Event;
use conductor_engine::{Agent, AgentError, EventStream, InvocationContext, RunRequest, Runner};
use conductor_store::{
    Database, InMemoryMemoryService, InMemorySessionService, SessionService, SqliteSessionService,
};
use conductor_telemetry::TelemetryConfig;

/// Run one turn of the built-in echo agent and print every event as a JSON line.
#[derive(Debug, Parser)]
#[command(name = "conductor", version)]
struct Cli {
    /// Message to send.
    message: String,

    #[arg(long, default_value = "conductor-demo")]
    app: String,

    #[arg(long, default_value = "local")]
    user: String,

    #[arg(long, default_value = "default")]
    session: String,

    /// SQLite database path. Defaults to ~/.conductor/database/sessions.db.
    #[arg(long, conflicts_with = "in_memory")]
    db: Option<PathBuf>,

    /// Keep sessions in memory instead of SQLite.
    #[arg(long)]
    in_memory: bool,

    #[arg(long, default_value_t = Level::WARN)]
    log_level: Level,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty_logs: bool,
}

/// Streams the message back word by word, then one final event that bumps
/// `turn_count` in session state.
struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "repeats the user's message"
    }

    async fn run(&self, ctx: InvocationContext) -> Result<EventStream, AgentError> {
        ctx.record_turn()?;
        let text = ctx.user_content().map(Content::text).unwrap_or_default();
        let turn_count = ctx
            .state_value("turn_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;

        let mut events: Vec<Result<Event, AgentError>> = text
            .split_inclusive(' ')
            .map(|word| Ok(ctx.new_event().with_content(Content::model_text(word)).partial()))
            .collect();
        events.push(Ok(ctx
            .new_event()
            .with_content(Content::model_text(text.clone()))
            .with_state_delta([("turn_count", serde_json::json!(turn_count))])
            .turn_complete()));

        Ok(Box::pin(stream::iter(events)))
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".conductor")
        .join("database")
        .join("sessions.db")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    conductor_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        module_levels: Vec::new(),
        json: !cli.pretty_logs,
    })?;

    let sessions: Arc<dyn SessionService> = if cli.in_memory {
        Arc::new(InMemorySessionService::new())
    } else {
        let path = cli.db.clone().unwrap_or_else(default_db_path);
        let db = Database::open(&path)
            .with_context(|| format!("opening session database at {}", path.display()))?;
        Arc::new(SqliteSessionService::new(db))
    };

    let runner = Runner::new(cli.app.clone(), Arc::new(EchoAgent), sessions)
        .with_memory_service(Arc::new(InMemoryMemoryService::new()));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let request = RunRequest::new(cli.user.clone(), cli.session.clone())
        .with_message(Content::user_text(cli.message.clone()));
    let mut events = runner.run_async(cancel, request).await?;
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }

    runner.close().await?;
    Ok(())
}
