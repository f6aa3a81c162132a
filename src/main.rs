use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use draftline::config::{Config, DatabaseConfig};
use draftline::http::{self, AppState};
use draftline::llm::{LlmClient, OpenAiChatClient, PerplexitySearchClient, SearchClient};
use draftline::recovery::RecoveryScanner;
use draftline::session::machine::SessionEngine;
use draftline::session::SessionConfig;
use draftline::store::{DraftStore, MemoryStore, PgStore, SessionStore, TaskStore};
use draftline::strategies;
use draftline::worker::{ChatCompletionExecutor, SearchExecutor, Worker};

#[derive(Parser)]
#[command(name = "draftline", version, about = "Durable chain-of-thought content pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the http api, the queue worker, and the recovery sweep together.
    Serve {
        /// Use an in-memory store instead of Postgres. State is lost on exit.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Run only the queue worker.
    Worker,
    /// Run one recovery sweep and exit.
    Recover,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Inspect and drive individual sessions.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create a session and start its first phase.
    New {
        #[arg(long)]
        theme: String,
        #[arg(long)]
        style: Option<String>,
        #[arg(long, default_value = "twitter")]
        platform: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Print a session, its phases, and its health report.
    Show { id: Uuid },
    /// Drive a session as far as it can go right now.
    Advance { id: Uuid },
    /// Re-arm a failed session with a fresh retry budget.
    Retry { id: Uuid },
    Pause { id: Uuid },
    Resume { id: Uuid },
    /// Print the drafts a completed session produced.
    Drafts { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("draftline=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Serve { ephemeral } => {
            if ephemeral {
                let store = Arc::new(MemoryStore::new());
                serve(store, config).await
            } else {
                let store = connect(&config).await?;
                serve(store, config).await
            }
        }
        Command::Worker => {
            let store = connect(&config).await?;
            let engine = build_engine(store.clone(), &config)?;
            build_worker(store, engine, &config)?.run().await;
            Ok(())
        }
        Command::Recover => {
            let store = connect(&config).await?;
            let engine = build_engine(store.clone(), &config)?;
            let scanner = RecoveryScanner::new(store, engine, config.recovery.clone());
            let report = scanner.sweep_once().await?;
            println!(
                "released {} stale claims, advanced {} sessions ({} errored), materialized {} drafts",
                report.stale_claims_released,
                report.sessions_advanced,
                report.sessions_errored,
                report.drafts_materialized
            );
            Ok(())
        }
        Command::Migrate => {
            let db = DatabaseConfig::from_env()?;
            let store = PgStore::connect(&db).await?;
            store.run_migrations().await?;
            println!("migrations applied");
            Ok(())
        }
        Command::Session { command } => {
            let store = connect(&config).await?;
            let engine = build_engine(store.clone(), &config)?;
            session_command(command, &engine, &config).await
        }
    }
}

async fn connect(_config: &Config) -> anyhow::Result<Arc<PgStore>> {
    let db = DatabaseConfig::from_env().context("database configuration")?;
    let store = PgStore::connect(&db).await?;
    store.run_migrations().await?;
    Ok(Arc::new(store))
}

fn build_engine<S>(store: Arc<S>, config: &Config) -> anyhow::Result<Arc<SessionEngine<S>>>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiChatClient::new(config.llm.clone())?);
    let strategies = Arc::new(strategies::default_pipeline(llm));
    Ok(Arc::new(SessionEngine::new(
        store,
        strategies,
        config.session.clone(),
        config.worker.max_task_retries,
    )))
}

fn build_worker<S>(
    store: Arc<S>,
    engine: Arc<SessionEngine<S>>,
    config: &Config,
) -> anyhow::Result<Worker<S>>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiChatClient::new(config.llm.clone())?);
    let search: Arc<dyn SearchClient> = Arc::new(PerplexitySearchClient::new(config.search.clone())?);
    Ok(Worker::new(store, engine, config.worker.clone())
        .register(Arc::new(ChatCompletionExecutor::new(llm)))
        .register(Arc::new(SearchExecutor::new(search))))
}

async fn serve<S>(store: Arc<S>, config: Config) -> anyhow::Result<()>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    let engine = build_engine(store.clone(), &config)?;
    let worker = build_worker(store.clone(), engine.clone(), &config)?;
    let scanner = RecoveryScanner::new(store, engine.clone(), config.recovery.clone());
    let state = Arc::new(AppState {
        engine,
        recovery: config.recovery.clone(),
    });

    tokio::select! {
        result = http::serve(&config.http, state) => result,
        _ = worker.run() => Ok(()),
        _ = scanner.run() => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

async fn session_command<S>(
    command: SessionCommand,
    engine: &Arc<SessionEngine<S>>,
    config: &Config,
) -> anyhow::Result<()>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    match command {
        SessionCommand::New {
            theme,
            style,
            platform,
            model,
        } => {
            let session = engine
                .create(SessionConfig {
                    theme,
                    style,
                    platform,
                    model,
                })
                .await?;
            println!("{}", session.id);
            let advanced = engine.advance(session.id).await?;
            println!("status: {}", advanced.status);
        }
        SessionCommand::Show { id } => {
            let session = engine
                .store()
                .get_session(id)
                .await?
                .context("session not found")?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            let report = engine.health(id, &config.recovery).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SessionCommand::Advance { id } => {
            let session = engine.advance(id).await?;
            println!(
                "status: {} (phase {}, step {})",
                session.status, session.current_phase, session.current_step
            );
        }
        SessionCommand::Retry { id } => {
            engine.retry(id).await?;
            let session = engine.advance(id).await?;
            println!("status: {}", session.status);
        }
        SessionCommand::Pause { id } => {
            engine.pause(id).await?;
            println!("paused");
        }
        SessionCommand::Resume { id } => {
            engine.resume(id).await?;
            println!("resumed");
        }
        SessionCommand::Drafts { id } => {
            let drafts = engine.store().list_drafts(id).await?;
            println!("{}", serde_json::to_string_pretty(&drafts)?);
        }
    }
    Ok(())
}
