//! Document Sync Engine.
//!
//! Keeps the local metadata rows and the remote document mirror converging
//! without a shared transaction: the local row is written before any remote
//! call, remote failures leave it `pending` for the reconciliation sweep,
//! and both deletion entry points end in the same `deleted` state.
//!
//! All mutations of rows for one `(user, date)` hold that key's lock, so the
//! sweep, local deletes and remote notifications never interleave on a row.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use diarist_store::{
    DeletionReason, DiaryDocument, DocumentStatus, SessionOutcome, SessionState, content_digest,
    day_key,
};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{StorageError, SyncError};
use crate::lock::KeyedLocks;
use crate::retry::{FailureClass, RetryDecision, RetryPolicy};
use crate::storage::BoundedStore;

// ── Remote seam ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDocument {
    pub document_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote service unavailable: {0}")]
    Transient(String),
    #[error("remote service rejected the request: {0}")]
    Permanent(String),
    #[error("remote document not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Transient(_) => FailureClass::Transient,
            Self::Permanent(_) | Self::NotFound(_) => FailureClass::Permanent,
        }
    }
}

/// The remote document store.  Implementations classify their failures;
/// the engine bounds every call with its own timeout.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    async fn create_document(&self, title: &str, markdown: &str)
    -> Result<RemoteDocument, RemoteError>;

    async fn replace_content(
        &self,
        document_id: &str,
        title: &str,
        markdown: &str,
    ) -> Result<(), RemoteError>;

    async fn grant_owner_access(
        &self,
        document_id: &str,
        owner_user_id: &str,
    ) -> Result<(), RemoteError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), RemoteError>;
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// An active document already holds this exact content.
    Unchanged(DiaryDocument),
    Created(DiaryDocument),
    Updated(DiaryDocument),
    /// Remote creation failed transiently; the row stays `pending`.
    Deferred(DiaryDocument),
}

impl SyncOutcome {
    pub fn document(&self) -> &DiaryDocument {
        match self {
            Self::Unchanged(doc) | Self::Created(doc) | Self::Updated(doc) | Self::Deferred(doc) => {
                doc
            }
        }
    }
}

/// What happened to the remote copy during a local teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTeardown {
    Deleted,
    AlreadyGone,
    Failed(String),
    /// The row never had a live remote document.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { document: Uuid, remote: RemoteTeardown },
    AlreadyDeleted { document: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Reconciled,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub total: usize,
    pub remote_deleted: usize,
    pub remote_failed: usize,
    pub local_only: usize,
    /// Rows still tracked because their local update failed.
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub activated: usize,
    pub deferred: usize,
    pub not_due: usize,
    pub creation_failed: usize,
    pub cancelled: usize,
    pub finalized: usize,
    /// Pending rows whose session is still aggregating.
    pub awaiting_session: usize,
    /// Stale aggregating sessions closed before the document pass.
    pub recovered_sessions: usize,
    pub errors: usize,
}

/// An active document as shown to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentListing {
    pub document: DiaryDocument,
    pub delete_command: String,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct DocumentSyncEngine {
    db: BoundedStore,
    api: Arc<dyn DocumentApi>,
    locks: KeyedLocks,
    policy: RetryPolicy,
    remote_timeout: Duration,
}

impl DocumentSyncEngine {
    pub fn new(
        db: BoundedStore,
        api: Arc<dyn DocumentApi>,
        policy: RetryPolicy,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            db,
            api,
            locks: KeyedLocks::new(),
            policy,
            remote_timeout,
        }
    }

    async fn remote<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "remote call exceeded {:?}",
                self.remote_timeout
            ))),
        }
    }

    async fn persist(&self, doc: &DiaryDocument) -> Result<(), StorageError> {
        let doc = doc.clone();
        self.db.call(move |db| db.put_document(&doc)).await
    }

    async fn reload(&self, id: Uuid) -> Result<Option<DiaryDocument>, StorageError> {
        self.db.call(move |db| db.get_document(id)).await
    }

    // ── Creation ──────────────────────────────────────────────────────────

    /// Make the remote document for `(user_id, date)` hold `content`.
    pub async fn create_or_update(
        &self,
        user_id: &str,
        date: NaiveDate,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let _guard = self.locks.lock(&day_key(user_id, date)).await;
        let digest = content_digest(content);

        match self.current_row(user_id, date).await? {
            Some(doc) if doc.status == DocumentStatus::Active && doc.content_digest == digest => {
                debug!(user_id = %user_id, date = %date, "document already up to date");
                Ok(SyncOutcome::Unchanged(doc))
            }
            Some(doc) if doc.status == DocumentStatus::Active => {
                self.update_active(doc, title, content, now).await
            }
            Some(mut doc) if doc.status == DocumentStatus::Pending => {
                doc.title = title.to_string();
                doc.content = content.to_string();
                doc.content_digest = digest;
                doc.updated_at = now;
                self.persist(&doc).await?;
                self.try_create(doc, now).await
            }
            Some(mut orphan) => {
                orphan.mark_deleted(DeletionReason::RemoteMissing, now);
                self.persist(&orphan).await?;
                self.create_fresh(user_id, date, title, content, now).await
            }
            None => self.create_fresh(user_id, date, title, content, now).await,
        }
    }

    /// Durably record `content` for `(user_id, date)` as a `pending` row
    /// without calling the remote side.  An active row is returned as is;
    /// `create_or_update` decides whether it needs replacing.
    pub async fn stage(
        &self,
        user_id: &str,
        date: NaiveDate,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<DiaryDocument, SyncError> {
        let _guard = self.locks.lock(&day_key(user_id, date)).await;

        let doc = match self.current_row(user_id, date).await? {
            Some(doc) if doc.status == DocumentStatus::Active => return Ok(doc),
            Some(mut doc) if doc.status == DocumentStatus::Pending => {
                doc.title = title.to_string();
                doc.content = content.to_string();
                doc.content_digest = content_digest(content);
                doc.updated_at = now;
                doc
            }
            Some(mut orphan) => {
                orphan.mark_deleted(DeletionReason::RemoteMissing, now);
                self.persist(&orphan).await?;
                DiaryDocument::pending(user_id, date, title, content, now)
            }
            None => DiaryDocument::pending(user_id, date, title, content, now),
        };
        self.persist(&doc).await?;
        debug!(user_id = %user_id, date = %date, document = %doc.id, "diary content staged");
        Ok(doc)
    }

    /// Whether `(user_id, date)` has a row that is not `deleted`.
    pub async fn has_live_row(&self, user_id: &str, date: NaiveDate) -> Result<bool, SyncError> {
        Ok(self.current_row(user_id, date).await?.is_some())
    }

    /// The newest row for `(user_id, date)` that is not `deleted`.
    async fn current_row(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DiaryDocument>, StorageError> {
        let user = user_id.to_string();
        let rows = self
            .db
            .call(move |db| db.documents_for_day(&user, date))
            .await?;
        Ok(rows
            .into_iter()
            .filter(|doc| doc.status != DocumentStatus::Deleted)
            .max_by_key(|doc| doc.created_at))
    }

    async fn create_fresh(
        &self,
        user_id: &str,
        date: NaiveDate,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let doc = DiaryDocument::pending(user_id, date, title, content, now);
        self.persist(&doc).await?;
        debug!(user_id = %user_id, date = %date, document = %doc.id, "pending document recorded");
        self.try_create(doc, now).await
    }

    /// One remote creation attempt for a pending row.  Caller holds the
    /// row's day lock.
    async fn try_create(
        &self,
        mut doc: DiaryDocument,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        doc.attempts += 1;
        let created = self
            .remote(self.api.create_document(&doc.title, &doc.content))
            .await;

        let remote = match created {
            Ok(remote) => remote,
            Err(err) => return self.creation_failed(doc, err, now).await,
        };

        doc.permission_warning = match self
            .remote(
                self.api
                    .grant_owner_access(&remote.document_id, &doc.owner_user_id),
            )
            .await
        {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    document_id = %remote.document_id,
                    owner = %doc.owner_user_id,
                    error = %err,
                    "permission grant failed; document stays usable"
                );
                Some(err.to_string())
            }
        };
        doc.status = DocumentStatus::Active;
        doc.document_id = Some(remote.document_id.clone());
        doc.url = Some(remote.url);
        doc.next_attempt_at = None;
        doc.last_error = None;
        doc.updated_at = now;

        if let Err(source) = self.persist(&doc).await {
            error!(
                document_id = %remote.document_id,
                row = %doc.id,
                error = %source,
                "remote document created but local record not updated"
            );
            return Err(SyncError::Partial {
                remote_document_id: remote.document_id,
                source,
            });
        }
        info!(
            user_id = %doc.owner_user_id,
            date = %doc.diary_date,
            document_id = %remote.document_id,
            attempts = doc.attempts,
            "diary document created"
        );
        Ok(SyncOutcome::Created(doc))
    }

    async fn creation_failed(
        &self,
        mut doc: DiaryDocument,
        err: RemoteError,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        doc.last_error = Some(err.to_string());
        doc.updated_at = now;
        match self.policy.decide(doc.attempts, err.class()) {
            RetryDecision::RetryAfter(delay) => {
                doc.next_attempt_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                self.persist(&doc).await?;
                warn!(
                    row = %doc.id,
                    attempts = doc.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "document creation deferred"
                );
                Ok(SyncOutcome::Deferred(doc))
            }
            RetryDecision::GiveUp => {
                doc.mark_deleted(DeletionReason::CreationFailed, now);
                self.persist(&doc).await?;
                warn!(row = %doc.id, attempts = doc.attempts, error = %err, "document creation failed");
                Err(SyncError::CreationFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn update_active(
        &self,
        mut doc: DiaryDocument,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let Some(remote_id) = doc.document_id.clone() else {
            return Err(SyncError::CreationFailed {
                reason: format!("active row {} has no remote id", doc.id),
            });
        };

        match self
            .remote(self.api.replace_content(&remote_id, title, content))
            .await
        {
            Ok(()) => {
                doc.title = title.to_string();
                doc.content = content.to_string();
                doc.content_digest = content_digest(content);
                doc.updated_at = now;
                self.persist(&doc)
                    .await
                    .map_err(|source| SyncError::Partial {
                        remote_document_id: remote_id.clone(),
                        source,
                    })?;
                info!(document_id = %remote_id, "diary document updated");
                Ok(SyncOutcome::Updated(doc))
            }
            Err(RemoteError::NotFound(_)) => {
                warn!(document_id = %remote_id, "remote document missing; recreating");
                doc.status = DocumentStatus::Orphaned;
                doc.updated_at = now;
                self.persist(&doc).await?;
                doc.mark_deleted(DeletionReason::RemoteMissing, now);
                self.persist(&doc).await?;
                self.create_fresh(&doc.owner_user_id, doc.diary_date, title, content, now)
                    .await
            }
            Err(err) => Err(SyncError::Remote(err)),
        }
    }

    // ── Deletion ──────────────────────────────────────────────────────────

    /// Resolve a user-supplied reference: a remote document id or a row id.
    async fn find(&self, reference: &str) -> Result<Option<DiaryDocument>, StorageError> {
        let remote_id = reference.to_string();
        if let Some(doc) = self
            .db
            .call(move |db| db.document_by_remote_id(&remote_id))
            .await?
        {
            return Ok(Some(doc));
        }
        match Uuid::parse_str(reference) {
            Ok(id) => self.reload(id).await,
            Err(_) => Ok(None),
        }
    }

    /// Local delete command.  The row ends `deleted` whether or not the
    /// remote delete succeeds.
    pub async fn delete(
        &self,
        user_id: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<DeleteOutcome, SyncError> {
        let found = self
            .find(reference.trim())
            .await?
            .filter(|doc| doc.owner_user_id == user_id);
        let Some(doc) = found else {
            return Err(SyncError::UnknownDocument(reference.to_string()));
        };
        self.teardown_row(doc, DeletionReason::LocalDelete, now).await
    }

    /// Delete every document the user still has.  Local rows end `deleted`
    /// even when their remote delete fails; rows whose local update fails
    /// are counted in `failed` and stay tracked for the next cleanup.
    pub async fn cleanup_all(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, SyncError> {
        let user = user_id.to_string();
        let docs = self
            .db
            .call(move |db| db.documents_for_owner(&user))
            .await?;
        let targets: Vec<DiaryDocument> = docs
            .into_iter()
            .filter(|doc| doc.status != DocumentStatus::Deleted)
            .collect();

        let results = join_all(
            targets
                .into_iter()
                .map(|doc| self.teardown_row(doc, DeletionReason::Cleanup, now)),
        )
        .await;

        let mut report = CleanupReport::default();
        for result in results {
            match result {
                Ok(DeleteOutcome::Deleted { remote, .. }) => {
                    report.total += 1;
                    match remote {
                        RemoteTeardown::Deleted | RemoteTeardown::AlreadyGone => {
                            report.remote_deleted += 1
                        }
                        RemoteTeardown::Failed(_) => report.remote_failed += 1,
                        RemoteTeardown::NotApplicable => report.local_only += 1,
                    }
                }
                Ok(DeleteOutcome::AlreadyDeleted { .. }) => {}
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "cleanup could not finalize a row");
                    report.failed += 1;
                }
            }
        }
        info!(
            user_id = %user_id,
            total = report.total,
            remote_failed = report.remote_failed,
            failed = report.failed,
            "cleanup finished"
        );
        Ok(report)
    }

    async fn teardown_row(
        &self,
        doc: DiaryDocument,
        reason: DeletionReason,
        now: DateTime<Utc>,
    ) -> Result<DeleteOutcome, SyncError> {
        let _guard = self.locks.lock(&doc.day_key()).await;
        let Some(mut doc) = self.reload(doc.id).await? else {
            return Err(SyncError::UnknownDocument(doc.id.to_string()));
        };
        if doc.status == DocumentStatus::Deleted {
            return Ok(DeleteOutcome::AlreadyDeleted { document: doc.id });
        }

        let remote = match (doc.status, doc.document_id.clone()) {
            (DocumentStatus::Active, Some(remote_id)) => {
                match self.remote(self.api.delete_document(&remote_id)).await {
                    Ok(()) => RemoteTeardown::Deleted,
                    Err(RemoteError::NotFound(_)) => RemoteTeardown::AlreadyGone,
                    Err(err) => {
                        warn!(
                            document_id = %remote_id,
                            error = %err,
                            "remote delete failed; dropping local tracking anyway"
                        );
                        doc.last_error = Some(err.to_string());
                        RemoteTeardown::Failed(err.to_string())
                    }
                }
            }
            _ => RemoteTeardown::NotApplicable,
        };

        doc.mark_deleted(reason, now);
        self.persist(&doc).await?;
        info!(
            row = %doc.id,
            reason = reason.label(),
            remote = ?remote,
            "diary document deleted"
        );
        Ok(DeleteOutcome::Deleted {
            document: doc.id,
            remote,
        })
    }

    /// Remote deletion notification.  Idempotent; unknown or already
    /// deleted ids are ignored.
    pub async fn notify_remote_deletion(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NotifyOutcome, SyncError> {
        let remote_id = document_id.to_string();
        let found = self
            .db
            .call(move |db| db.document_by_remote_id(&remote_id))
            .await?;
        let Some(doc) = found else {
            debug!(document_id = %document_id, "deletion notice for unknown document");
            return Ok(NotifyOutcome::Ignored);
        };

        let _guard = self.locks.lock(&doc.day_key()).await;
        let Some(mut doc) = self.reload(doc.id).await? else {
            return Ok(NotifyOutcome::Ignored);
        };
        match doc.status {
            DocumentStatus::Active | DocumentStatus::Orphaned => {
                doc.mark_deleted(DeletionReason::RemoteDeleted, now);
                self.persist(&doc).await?;
                info!(document_id = %document_id, owner = %doc.owner_user_id, "remote deletion reconciled");
                Ok(NotifyOutcome::Reconciled)
            }
            DocumentStatus::Pending | DocumentStatus::Deleted => {
                debug!(document_id = %document_id, status = doc.status.label(), "deletion notice ignored");
                Ok(NotifyOutcome::Ignored)
            }
        }
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Active documents only, newest diary date first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<DocumentListing>, SyncError> {
        let user = user_id.to_string();
        let docs = self
            .db
            .call(move |db| db.documents_for_owner(&user))
            .await?;
        let mut listings: Vec<DocumentListing> = docs
            .into_iter()
            .filter(|doc| doc.status == DocumentStatus::Active)
            .filter_map(|doc| {
                let remote_id = doc.document_id.clone()?;
                Some(DocumentListing {
                    delete_command: format!("/delete {remote_id}"),
                    document: doc,
                })
            })
            .collect();
        listings.sort_by(|a, b| b.document.diary_date.cmp(&a.document.diary_date));
        Ok(listings)
    }

    // ── Reconciliation ────────────────────────────────────────────────────

    /// One sweep over `pending` and `orphaned` rows.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<SweepReport, SyncError> {
        let candidates = self
            .db
            .call(|db| db.documents_with_status(&[DocumentStatus::Pending, DocumentStatus::Orphaned]))
            .await?;

        let mut report = SweepReport::default();
        for candidate in candidates {
            report.examined += 1;
            if let Err(err) = self.reconcile_row(candidate, now, &mut report).await {
                report.errors += 1;
                warn!(error = %err, "sweep could not reconcile a row");
            }
        }
        if report.examined > 0 {
            info!(
                examined = report.examined,
                activated = report.activated,
                deferred = report.deferred,
                creation_failed = report.creation_failed,
                cancelled = report.cancelled,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    async fn reconcile_row(
        &self,
        candidate: DiaryDocument,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), SyncError> {
        let _guard = self.locks.lock(&candidate.day_key()).await;
        let Some(mut doc) = self.reload(candidate.id).await? else {
            return Ok(());
        };

        match doc.status {
            DocumentStatus::Orphaned => {
                doc.mark_deleted(DeletionReason::RemoteMissing, now);
                self.persist(&doc).await?;
                report.finalized += 1;
                return Ok(());
            }
            DocumentStatus::Pending => {}
            DocumentStatus::Active | DocumentStatus::Deleted => return Ok(()),
        }

        if doc.next_attempt_at.is_some_and(|due| due > now) {
            report.not_due += 1;
            return Ok(());
        }

        let owner = doc.owner_user_id.clone();
        let date = doc.diary_date;
        let session = self.db.call(move |db| db.get_session(&owner, date)).await?;
        if session
            .as_ref()
            .is_some_and(|session| session.state == SessionState::Aggregating)
        {
            report.awaiting_session += 1;
            return Ok(());
        }
        let summarized = session
            .and_then(|session| session.outcome)
            .is_some_and(|outcome| outcome == SessionOutcome::Summarized);
        if !summarized {
            doc.mark_deleted(DeletionReason::Cancelled, now);
            self.persist(&doc).await?;
            info!(row = %doc.id, "pending document cancelled; session was not summarized");
            report.cancelled += 1;
            return Ok(());
        }

        if doc.attempts >= self.policy.max_attempts {
            doc.mark_deleted(DeletionReason::CreationFailed, now);
            self.persist(&doc).await?;
            report.creation_failed += 1;
            return Ok(());
        }

        match self.try_create(doc, now).await {
            Ok(SyncOutcome::Deferred(_)) => report.deferred += 1,
            Ok(_) => report.activated += 1,
            Err(SyncError::CreationFailed { .. }) => report.creation_failed += 1,
            Err(err) => return Err(err),
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
