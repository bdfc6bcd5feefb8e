use std::time::Duration;

use chrono::NaiveDate;
use diarist_store::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::sync::RemoteError;

/// Coarse classification every engine error maps onto, so callers can tell
/// "nothing happened" from "partially happened" and whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself was wrong or arrived in the wrong state.
    User,
    /// Nothing durable changed; trying again later may succeed.
    Transient,
    /// Terminal; retrying the same request will not help.
    Permanent,
    /// Some side effects happened and others did not.
    Partial,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unsupported message kind `{0}`")]
    UnsupportedKind(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Failure of a bounded metadata-store call.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metadata store call exceeded {0:?}")]
    Timeout(Duration),
    #[error("metadata store worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("the diary for {date} has already been produced")]
    SessionClosed { user_id: String, date: NaiveDate },
    #[error("no open session for {date}")]
    NoOpenSession { user_id: String, date: NaiveDate },
    #[error("the session for {date} has no entries yet")]
    EmptySession { user_id: String, date: NaiveDate },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum SummarizeError {
    /// The model kept failing transiently until the attempt cap was reached.
    #[error("summarizer gave up after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
    /// The model rejected the request or produced nothing usable.
    #[error("summarizer failed permanently: {reason}")]
    Rejected { reason: String },
}

impl SummarizeError {
    pub fn reason(&self) -> &str {
        match self {
            Self::Exhausted { reason, .. } | Self::Rejected { reason } => reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no diary document `{0}`")]
    UnknownDocument(String),
    #[error("remote document creation failed: {reason}")]
    CreationFailed { reason: String },
    /// The remote side changed but the local record could not be updated.
    #[error("remote document {remote_document_id} was created but the local record is stale: {source}")]
    Partial {
        remote_document_id: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Remote(RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum DiaryError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Summarize(#[from] SummarizeError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// The summary was produced but never stored; its session is closed.
    #[error("the diary for {date} was written but could not be saved: {source}")]
    Unsaved {
        date: NaiveDate,
        #[source]
        source: SyncError,
    },
}

impl DiaryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Normalize(_) => ErrorKind::User,
            Self::Session(SessionError::Storage(_)) => ErrorKind::Transient,
            Self::Session(_) => ErrorKind::User,
            Self::Summarize(_) => ErrorKind::Permanent,
            Self::Sync(SyncError::UnknownDocument(_)) => ErrorKind::User,
            Self::Sync(SyncError::CreationFailed { .. }) => ErrorKind::Permanent,
            Self::Sync(SyncError::Partial { .. }) => ErrorKind::Partial,
            Self::Sync(SyncError::Remote(RemoteError::Transient(_))) => ErrorKind::Transient,
            Self::Sync(SyncError::Remote(_)) => ErrorKind::Permanent,
            Self::Sync(SyncError::Storage(_)) => ErrorKind::Transient,
            Self::Unsaved { .. } => ErrorKind::Permanent,
        }
    }
}
