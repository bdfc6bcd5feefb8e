mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use diarist_config::AppConfig;
use diarist_engine::{
    BoundedStore, DEFAULT_HISTORY_DAYS, DiaryService, SessionStore, TimezoneResolver,
    history_start,
};
use diarist_feishu::FeishuClient;
use diarist_llm::LlmRouter;
use diarist_store::{MetadataStore, SessionOutcome};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "diarist",
    version,
    about = "Turns a day of chat messages into a Feishu diary document"
)]
struct Cli {
    /// Configuration file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Handle Feishu event bodies read from stdin, one JSON object per line.
    Run {
        /// Print replies to stdout instead of sending them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one reconciliation pass over pending and orphaned documents.
    Sweep,
    /// List a user's active diary documents.
    List {
        #[arg(long)]
        user: String,
    },
    /// Show a user's recent sessions.
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY_DAYS)]
        days: u32,
    },
    /// Apply a remote deletion notice for a Feishu document.
    NotifyDeleted {
        #[arg(value_name = "DOCUMENT_ID")]
        document_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _log_guard = init_tracing(&config)?;

    match cli.command {
        Commands::Run { dry_run } => {
            let (service, client) = build_service(&config)?;
            run::run_stdin(&config, service, client, dry_run).await?;
        }
        Commands::Sweep => {
            let (service, _) = build_service(&config)?;
            let report = service.reconcile(Utc::now()).await?;
            println!("examined        : {}", report.examined);
            println!("activated       : {}", report.activated);
            println!("deferred        : {}", report.deferred);
            println!("not yet due     : {}", report.not_due);
            println!("creation failed : {}", report.creation_failed);
            println!("cancelled       : {}", report.cancelled);
            println!("orphans closed  : {}", report.finalized);
            println!("awaiting close  : {}", report.awaiting_session);
            println!("stale sessions  : {}", report.recovered_sessions);
            println!("errors          : {}", report.errors);
        }
        Commands::List { user } => {
            let (service, _) = build_service(&config)?;
            let listings = service.sync().list(&user).await?;
            if listings.is_empty() {
                println!("no active diary documents for {user}");
            }
            for listing in listings {
                let doc = listing.document;
                println!(
                    "{}  {}  {}  ({})",
                    doc.diary_date,
                    doc.title,
                    doc.url.as_deref().unwrap_or("-"),
                    listing.delete_command
                );
            }
        }
        Commands::History { user, days } => {
            // Read-only: needs neither the model nor Feishu credentials.
            let store = open_store(&config)?;
            let tz = TimezoneResolver::from_config(&config.diary);
            let today = tz.date_of(&user, Utc::now());
            let sessions = SessionStore::new(store, tz)
                .query(&user, history_start(today, days), today)
                .try_collect::<Vec<_>>()
                .await?;
            if sessions.is_empty() {
                println!("no sessions for {user} in the last {days} days");
            }
            for session in sessions {
                let outcome = match &session.outcome {
                    Some(SessionOutcome::Summarized) => "summarized".to_string(),
                    Some(SessionOutcome::SummaryFailed { reason }) => format!("summary failed: {reason}"),
                    None => String::new(),
                };
                println!(
                    "{}  {:<11}  {:>3} events  {outcome}",
                    session.diary_date,
                    session.state.label(),
                    session.events.len(),
                );
            }
        }
        Commands::NotifyDeleted { document_id } => {
            let (service, _) = build_service(&config)?;
            let outcome = service.notify_remote_deletion(&document_id, Utc::now()).await?;
            println!("{document_id}: {outcome:?}");
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `telemetry.log_level`.  A non-empty
/// `telemetry.log_dir` adds a daily-rolling file; keep the guard alive.
fn init_tracing(config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if config.telemetry.log_dir.trim().is_empty() {
        (None, None)
    } else {
        std::fs::create_dir_all(&config.telemetry.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.telemetry.log_dir, "diarist.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn open_store(config: &AppConfig) -> Result<BoundedStore> {
    let store = MetadataStore::open(&config.storage.database_path)
        .with_context(|| format!("opening {}", config.storage.database_path))?;
    Ok(BoundedStore::new(
        store,
        Duration::from_millis(config.sync.db_timeout_ms.max(1)),
    ))
}

fn build_service(config: &AppConfig) -> Result<(Arc<DiaryService>, Arc<FeishuClient>)> {
    let store = open_store(config)?;
    let router = LlmRouter::from_config(&config.llm)?;
    let provider = router.provider();
    let client = Arc::new(FeishuClient::new(
        &config.feishu,
        Duration::from_secs(config.sync.remote_timeout_secs),
    )?);
    let service = DiaryService::new(store, Arc::new(router), client.clone(), config);
    tracing::info!(
        provider = ?provider,
        model = %config.active_model(),
        database = %config.storage.database_path,
        "diary service ready"
    );
    Ok((Arc::new(service), client))
}
