use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use diarist_config::AppConfig;
use diarist_engine::DiaryService;
use diarist_feishu::{EventDeduper, EventHandler, FeishuClient, HandleOutcome, decode_event};

/// Read event bodies from stdin until EOF or Ctrl-C.  Each line is handled
/// on its own task; the reconciliation sweep runs alongside.
pub(crate) async fn run_stdin(
    config: &AppConfig,
    service: Arc<DiaryService>,
    client: Arc<FeishuClient>,
    dry_run: bool,
) -> Result<()> {
    let handler = Arc::new(EventHandler::new(
        service.clone(),
        EventDeduper::from_config(&config.ingest),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        service,
        Duration::from_secs(config.sync.sweep_interval_secs.max(1)),
        shutdown_rx,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    info!(dry_run, "reading feishu events from stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let handler = handler.clone();
                let client = client.clone();
                tasks.spawn(async move { handle_line(&handler, &client, &line, dry_run).await });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; finishing in-flight events");
                break;
            }
        }
        while let Some(done) = tasks.try_join_next() {
            if let Err(err) = done {
                warn!(error = %err, "event task failed");
            }
        }
    }

    while let Some(done) = tasks.join_next().await {
        if let Err(err) = done {
            warn!(error = %err, "event task failed");
        }
    }
    let _ = shutdown_tx.send(true);
    sweeper.await?;
    Ok(())
}

async fn handle_line(handler: &EventHandler, client: &FeishuClient, line: &str, dry_run: bool) {
    let event = match decode_event(line) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "undecodable event body");
            return;
        }
    };

    match handler.handle(event, Utc::now()).await {
        HandleOutcome::Challenge(challenge) => {
            println!("{}", serde_json::json!({ "challenge": challenge }));
        }
        HandleOutcome::Reply { open_id, reply } => {
            if dry_run {
                println!(
                    "{}",
                    serde_json::json!({ "open_id": open_id, "status": reply.status, "text": reply.text })
                );
            } else if let Err(err) = client.send_text(&open_id, &reply.text).await {
                warn!(user_id = %open_id, error = %err, "reply not delivered");
            }
        }
        HandleOutcome::Silent => {}
    }
}

fn spawn_sweeper(
    service: Arc<DiaryService>,
    interval: Duration,
    mut rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() { break; }
                    continue;
                }
            }

            match service.reconcile(Utc::now()).await {
                Ok(report) if report.examined > 0 || report.recovered_sessions > 0 => {
                    info!(
                        examined = report.examined,
                        activated = report.activated,
                        deferred = report.deferred,
                        creation_failed = report.creation_failed,
                        cancelled = report.cancelled,
                        awaiting_session = report.awaiting_session,
                        recovered_sessions = report.recovered_sessions,
                        "reconciliation sweep"
                    );
                }
                Ok(_) => debug!("reconciliation sweep: nothing to do"),
                Err(err) => warn!(error = %err, "reconciliation sweep failed"),
            }
        }
    })
}
