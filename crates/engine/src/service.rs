use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use diarist_config::AppConfig;
use diarist_llm::ChatModel;
use diarist_store::{DiarySession, SessionOutcome};
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};

use crate::commands::{Command, DEFAULT_HISTORY_DAYS, Reply, ReplyStatus, ingest_reply};
use crate::error::{DiaryError, NormalizeError, SyncError};
use crate::follow_up::{FOLLOW_UP_CONTEXT, FollowUpWriter};
use crate::normalizer::{Normalizer, RawMessage};
use crate::retry::RetryPolicy;
use crate::session::{OpenedSession, SessionRef, SessionStore, history_start};
use crate::storage::BoundedStore;
use crate::summarizer::Summarizer;
use crate::sync::{
    CleanupReport, DeleteOutcome, DocumentApi, DocumentSyncEngine, NotifyOutcome, RemoteError,
    RemoteTeardown, SweepReport, SyncOutcome,
};
use crate::tz::TimezoneResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Appended(SessionRef),
    /// The message kind has no diary representation.
    Dropped { kind: String },
}

/// Wires the normalizer, session store, summarizer and document sync
/// engine together and maps commands onto them.
pub struct DiaryService {
    normalizer: Normalizer,
    sessions: SessionStore,
    summarizer: Summarizer,
    follow_up: Option<FollowUpWriter>,
    sync: DocumentSyncEngine,
    stale_after: chrono::Duration,
}

impl DiaryService {
    pub fn new(
        db: BoundedStore,
        model: Arc<dyn ChatModel>,
        api: Arc<dyn DocumentApi>,
        config: &AppConfig,
    ) -> Self {
        let tz = TimezoneResolver::from_config(&config.diary);
        let policy = RetryPolicy::from_config(&config.sync);
        let follow_up = config.diary.follow_up_questions.then(|| {
            FollowUpWriter::new(
                model.clone(),
                Duration::from_secs(config.diary.follow_up_timeout_secs.max(1)),
                tz.clone(),
            )
        });
        let stale_secs = i64::try_from(config.sync.stale_aggregation_secs).unwrap_or(i64::MAX);
        Self {
            normalizer: Normalizer::new(),
            sessions: SessionStore::new(db.clone(), tz.clone()),
            summarizer: Summarizer::new(
                model,
                policy,
                Duration::from_secs(config.llm.timeout_secs.max(1)),
                tz,
                config.diary.title_prefix.clone(),
            ),
            follow_up,
            stale_after: chrono::Duration::try_seconds(stale_secs)
                .unwrap_or(chrono::Duration::MAX),
            sync: DocumentSyncEngine::new(
                db,
                api,
                policy,
                Duration::from_secs(config.sync.remote_timeout_secs.max(1)),
            ),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sync(&self) -> &DocumentSyncEngine {
        &self.sync
    }

    /// Normalize and append one inbound message.  Unsupported kinds are
    /// dropped without error.
    pub async fn ingest(&self, raw: &RawMessage) -> Result<IngestOutcome, DiaryError> {
        let event = match self.normalizer.normalize(raw) {
            Ok(event) => event,
            Err(NormalizeError::UnsupportedKind(kind)) => {
                debug!(user_id = %raw.user_id, kind = %kind, "dropping unsupported message");
                return Ok(IngestOutcome::Dropped { kind });
            }
            Err(err) => return Err(err.into()),
        };
        Ok(IngestOutcome::Appended(self.sessions.append(event).await?))
    }

    /// Ingest one message and produce its reply: a follow-up question when
    /// enabled and the model answers, else the plain acknowledgement.
    /// `None` means stay silent.
    pub async fn ingest_and_reply(&self, raw: &RawMessage) -> Option<Reply> {
        let result = self.ingest(raw).await;
        if let (Some(writer), Ok(IngestOutcome::Appended(session))) = (&self.follow_up, &result) {
            let recent = self
                .sessions
                .recent_events(&session.user_id, session.diary_date, FOLLOW_UP_CONTEXT)
                .await;
            match recent {
                Ok(recent) => {
                    if let Some(text) = writer.follow_up(&session.user_id, &recent).await {
                        return Some(Reply::done(text));
                    }
                }
                Err(err) => {
                    debug!(user_id = %session.user_id, error = %err, "no context for follow-up");
                }
            }
        }
        ingest_reply(&result)
    }

    /// Close the session for `(user_id, date)`, summarize it once and sync
    /// the resulting document.
    ///
    /// The rendered diary is staged as a `pending` row before the session is
    /// closed.  Failures after staging leave work the sweep finishes and
    /// come back as `Deferred`.
    pub async fn aggregate(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, DiaryError> {
        let events = self.sessions.begin_aggregation(user_id, date).await?;

        let text = match self.summarizer.summarize(user_id, date, &events).await {
            Ok(text) => text,
            Err(err) => {
                let outcome = SessionOutcome::SummaryFailed {
                    reason: err.reason().to_string(),
                };
                if let Err(close_err) = self.sessions.mark_closed(user_id, date, outcome).await {
                    error!(user_id = %user_id, date = %date, error = %close_err, "session left aggregating");
                }
                return Err(err.into());
            }
        };

        let markdown = text.render_markdown();
        let staged = match self.sync.stage(user_id, date, &text.title, &markdown, now).await {
            Ok(staged) => staged,
            Err(err) => {
                error!(user_id = %user_id, date = %date, error = %err, "diary could not be staged");
                let outcome = SessionOutcome::SummaryFailed {
                    reason: format!("diary could not be saved: {err}"),
                };
                if let Err(close_err) = self.sessions.mark_closed(user_id, date, outcome).await {
                    error!(user_id = %user_id, date = %date, error = %close_err, "session left aggregating");
                }
                return Err(DiaryError::Unsaved { date, source: err });
            }
        };

        match self
            .sessions
            .mark_closed(user_id, date, SessionOutcome::Summarized)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(user_id = %user_id, date = %date, "session closed elsewhere; leaving the staged diary to the sweep");
                return Ok(SyncOutcome::Deferred(staged));
            }
            Err(err) => {
                warn!(user_id = %user_id, date = %date, error = %err, "session close deferred to the sweep");
                return Ok(SyncOutcome::Deferred(staged));
            }
        }

        match self
            .sync
            .create_or_update(user_id, date, &text.title, &markdown, now)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err @ (SyncError::Storage(_) | SyncError::Remote(RemoteError::Transient(_)))) => {
                warn!(user_id = %user_id, date = %date, error = %err, "document sync deferred to the sweep");
                Ok(SyncOutcome::Deferred(staged))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Sessions from the last `days` days up to and including `today`.
    pub async fn history(
        &self,
        user_id: &str,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<DiarySession>, DiaryError> {
        let sessions = self
            .sessions
            .query(user_id, history_start(today, days), today)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(sessions)
    }

    pub async fn notify_remote_deletion(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NotifyOutcome, DiaryError> {
        Ok(self.sync.notify_remote_deletion(document_id, now).await?)
    }

    /// One maintenance pass: close sessions stuck in `aggregating`, then
    /// reconcile pending and orphaned document rows.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<SweepReport, DiaryError> {
        let (recovered, errors) = self.recover_stale_aggregations(now).await?;
        let mut report = self.sync.reconcile(now).await?;
        report.recovered_sessions = recovered;
        report.errors += errors;
        Ok(report)
    }

    /// A stale aggregating session whose diary was staged closes as
    /// summarized and its row is synced by the same sweep; one without a
    /// staged row closes as failed.
    async fn recover_stale_aggregations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), DiaryError> {
        let Some(cutoff) = now.checked_sub_signed(self.stale_after) else {
            return Ok((0, 0));
        };
        let stale = self.sessions.stale_aggregations(cutoff).await?;
        let (mut recovered, mut errors) = (0, 0);
        for session in stale {
            let (user_id, date) = (session.user_id.as_str(), session.diary_date);
            let outcome = match self.sync.has_live_row(user_id, date).await {
                Ok(true) => SessionOutcome::Summarized,
                Ok(false) => SessionOutcome::SummaryFailed {
                    reason: "aggregation was interrupted".to_string(),
                },
                Err(err) => {
                    warn!(user_id = %user_id, date = %date, error = %err, "stale session not recovered");
                    errors += 1;
                    continue;
                }
            };
            match self.sessions.mark_closed(user_id, date, outcome.clone()).await {
                Ok(true) => {
                    info!(user_id = %user_id, date = %date, outcome = ?outcome, "stale aggregation recovered");
                    recovered += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(user_id = %user_id, date = %date, error = %err, "stale session not recovered");
                    errors += 1;
                }
            }
        }
        Ok((recovered, errors))
    }

    /// Run one command and render exactly one reply for it.
    pub async fn execute(&self, user_id: &str, now: DateTime<Utc>, command: Command) -> Reply {
        let today = self.sessions.date_of(user_id, now);
        let result = match command {
            Command::Help => Ok(Reply::help()),
            Command::NewSession => self.new_session(user_id, now).await,
            Command::AggregateNow => self
                .aggregate(user_id, today, now)
                .await
                .map(|outcome| aggregate_reply(today, &outcome)),
            Command::ListDocuments => self.list_reply(user_id).await,
            Command::DeleteDocument(reference) if reference.trim().is_empty() => Ok(Reply::new(
                ReplyStatus::Rejected,
                "Usage: /delete <id>. Use /list to find the id.",
            )),
            Command::DeleteDocument(reference) => self
                .sync
                .delete(user_id, &reference, now)
                .await
                .map(|outcome| delete_reply(&reference, &outcome))
                .map_err(DiaryError::from),
            Command::CleanupAll => self
                .sync
                .cleanup_all(user_id, now)
                .await
                .map(|report| cleanup_reply(&report))
                .map_err(DiaryError::from),
            Command::QueryHistory { days } => self.history_reply(user_id, today, days).await,
        };

        result.unwrap_or_else(|err| {
            warn!(user_id = %user_id, kind = ?err.kind(), error = %err, "command failed");
            Reply::from_error(&err)
        })
    }

    async fn new_session(&self, user_id: &str, now: DateTime<Utc>) -> Result<Reply, DiaryError> {
        let reply = match self.sessions.open_session(user_id, now).await? {
            OpenedSession::Created(session) => Reply::done(format!(
                "Started your diary session for {}. Tell me about your day.",
                session.diary_date
            )),
            OpenedSession::AlreadyOpen(session) => Reply::done(format!(
                "Your diary session for {} is already open with {} entr{}.",
                session.diary_date,
                session.event_count,
                if session.event_count == 1 { "y" } else { "ies" }
            )),
        };
        Ok(reply)
    }

    async fn list_reply(&self, user_id: &str) -> Result<Reply, DiaryError> {
        let listings = self.sync.list(user_id).await?;
        if listings.is_empty() {
            return Ok(Reply::done("You have no diary documents yet."));
        }
        let mut lines = vec![format!("Your diary documents ({}):", listings.len())];
        for listing in &listings {
            let doc = &listing.document;
            lines.push(format!(
                "{}  {}\n{}\n  {}",
                doc.diary_date,
                doc.title,
                doc.url.as_deref().unwrap_or("-"),
                listing.delete_command
            ));
        }
        Ok(Reply::done(lines.join("\n")))
    }

    async fn history_reply(
        &self,
        user_id: &str,
        today: NaiveDate,
        days: u32,
    ) -> Result<Reply, DiaryError> {
        let days = if days == 0 { DEFAULT_HISTORY_DAYS } else { days };
        let sessions = self.history(user_id, today, days).await?;
        if sessions.is_empty() {
            return Ok(Reply::done(format!("No diary sessions in the last {days} days.")));
        }
        let mut lines = vec![format!("Sessions in the last {days} days:")];
        for session in sessions.iter().rev() {
            let outcome = match &session.outcome {
                Some(SessionOutcome::Summarized) => " (diary written)".to_string(),
                Some(SessionOutcome::SummaryFailed { reason }) => format!(" (diary failed: {reason})"),
                None => String::new(),
            };
            lines.push(format!(
                "{}  {}  {} entr{}{outcome}",
                session.diary_date,
                session.state.label(),
                session.events.len(),
                if session.events.len() == 1 { "y" } else { "ies" }
            ));
        }
        Ok(Reply::done(lines.join("\n")))
    }
}

fn aggregate_reply(date: NaiveDate, outcome: &SyncOutcome) -> Reply {
    let doc = outcome.document();
    match outcome {
        SyncOutcome::Deferred(_) => Reply::new(
            ReplyStatus::Partial,
            format!(
                "Your diary for {date} is written and saved, but its document is not created yet. I'll keep trying; it will appear in /list once ready."
            ),
        ),
        SyncOutcome::Created(_) | SyncOutcome::Updated(_) | SyncOutcome::Unchanged(_) => {
            let mut text = format!(
                "Your diary for {date} is ready: {}",
                doc.url.as_deref().unwrap_or("-")
            );
            if doc.permission_warning.is_some() {
                text.push_str("\n(I couldn't give you edit access automatically; ask the operator if you need it.)");
            }
            Reply::done(text)
        }
    }
}

fn cleanup_reply(report: &CleanupReport) -> Reply {
    let text = format!(
        "Cleaned up {} diary document(s): {} removed from the document service, {} could not be removed there, {} never reached it.",
        report.total, report.remote_deleted, report.remote_failed, report.local_only
    );
    if report.failed == 0 {
        return Reply::done(text);
    }
    Reply::new(
        ReplyStatus::Partial,
        format!(
            "{text} {} more could not be cleaned up right now; send /cleantest again to finish.",
            report.failed
        ),
    )
}

fn delete_reply(reference: &str, outcome: &DeleteOutcome) -> Reply {
    match outcome {
        DeleteOutcome::Deleted {
            remote: RemoteTeardown::Failed(_),
            ..
        } => Reply::done(format!(
            "Deleted diary document {reference}. The copy in the document service could not be removed, but it is no longer tracked."
        )),
        DeleteOutcome::Deleted { .. } => Reply::done(format!("Deleted diary document {reference}.")),
        DeleteOutcome::AlreadyDeleted { .. } => {
            Reply::done(format!("Diary document {reference} was already deleted."))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
