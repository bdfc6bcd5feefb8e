use serde::Serialize;

use crate::error::{DiaryError, ErrorKind, NormalizeError, SessionError, SummarizeError, SyncError};
use crate::service::IngestOutcome;

pub const DEFAULT_HISTORY_DAYS: u32 = 7;

pub const HELP_TEXT: &str = "\
Send me text, voice or photos during the day and I'll keep them in today's diary.

/diary        write today's diary now
/new          start today's session
/list         list your diary documents
/delete <id>  delete a diary document
/query [days] show recent sessions (default 7 days)
/cleantest    delete all of your diary documents
/help         show this message";

/// The closed set of user commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NewSession,
    AggregateNow,
    ListDocuments,
    DeleteDocument(String),
    CleanupAll,
    QueryHistory { days: u32 },
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Done,
    /// Some of the work happened; the text says what is still outstanding.
    Partial,
    RetryLater,
    Rejected,
    Failed,
}

/// The single user-facing response to a command or message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub status: ReplyStatus,
    pub text: String,
}

impl Reply {
    pub fn new(status: ReplyStatus, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self::new(ReplyStatus::Done, text)
    }

    pub fn help() -> Self {
        Self::done(HELP_TEXT)
    }

    pub fn from_error(err: &DiaryError) -> Self {
        let status = match err.kind() {
            ErrorKind::User => ReplyStatus::Rejected,
            ErrorKind::Transient => ReplyStatus::RetryLater,
            ErrorKind::Permanent => ReplyStatus::Failed,
            ErrorKind::Partial => ReplyStatus::Partial,
        };
        let text = match err {
            DiaryError::Normalize(NormalizeError::MalformedPayload(reason)) => {
                format!("I couldn't read that message ({reason}), so it was not recorded.")
            }
            DiaryError::Normalize(NormalizeError::UnsupportedKind(kind)) => {
                format!("I can't keep `{kind}` messages in a diary yet.")
            }
            DiaryError::Session(SessionError::SessionClosed { date, .. }) => format!(
                "Your diary for {date} has already been written, so new messages for that day are not recorded."
            ),
            DiaryError::Session(SessionError::NoOpenSession { date, .. }) => format!(
                "There is nothing left to write for {date}. Send me a few messages about your day first."
            ),
            DiaryError::Session(SessionError::EmptySession { date, .. }) => {
                format!("Your session for {date} has no entries yet. Tell me about your day first.")
            }
            DiaryError::Summarize(SummarizeError::Exhausted { reason, .. }) => format!(
                "Sorry, the diary could not be written because the writing service kept failing ({reason}). Your messages are kept in /query history."
            ),
            DiaryError::Summarize(SummarizeError::Rejected { reason }) => format!(
                "Sorry, the diary could not be written ({reason}). Your messages are kept in /query history."
            ),
            DiaryError::Sync(SyncError::UnknownDocument(reference)) => format!(
                "No diary document `{reference}` was found. Use /list to see your documents."
            ),
            DiaryError::Sync(SyncError::CreationFailed { reason }) => format!(
                "Your diary was written but the document could not be created ({reason})."
            ),
            DiaryError::Sync(SyncError::Partial {
                remote_document_id, ..
            }) => format!(
                "Your document {remote_document_id} was created but could not be recorded locally. Please tell the operator."
            ),
            DiaryError::Sync(SyncError::Remote(err)) => {
                format!("The document service did not accept the change ({err}).")
            }
            DiaryError::Unsaved { date, .. } => format!(
                "Sorry, your diary for {date} was written but could not be saved. Your messages are kept in /query history."
            ),
            DiaryError::Session(SessionError::Storage(_)) | DiaryError::Sync(SyncError::Storage(_)) => {
                "The diary store is busy right now. Please try again in a moment.".to_string()
            }
        };
        Self { status, text }
    }
}

/// Acknowledgement for an inbound message.  `None` means stay silent.
pub fn ingest_reply(result: &Result<IngestOutcome, DiaryError>) -> Option<Reply> {
    match result {
        Ok(IngestOutcome::Appended(session)) => Some(Reply::done(format!(
            "Noted. {} entr{} for {} so far; send /diary when you're done.",
            session.event_count,
            if session.event_count == 1 { "y" } else { "ies" },
            session.diary_date
        ))),
        Ok(IngestOutcome::Dropped { .. }) => None,
        Err(err) => Some(Reply::from_error(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::session::SessionRef;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let closed = DiaryError::from(SessionError::SessionClosed {
            user_id: "ou_a".into(),
            date: date(),
        });
        let reply = Reply::from_error(&closed);
        assert_eq!(reply.status, ReplyStatus::Rejected);
        assert!(reply.text.contains("2025-03-14"));

        let busy = DiaryError::from(SyncError::Storage(StorageError::Timeout(
            Duration::from_millis(10),
        )));
        assert_eq!(Reply::from_error(&busy).status, ReplyStatus::RetryLater);

        let failed = DiaryError::from(SummarizeError::Rejected {
            reason: "quota exceeded".into(),
        });
        let reply = Reply::from_error(&failed);
        assert_eq!(reply.status, ReplyStatus::Failed);
        assert!(reply.text.contains("quota exceeded"));

        let unsaved = DiaryError::Unsaved {
            date: date(),
            source: SyncError::Storage(StorageError::Timeout(Duration::from_millis(10))),
        };
        let reply = Reply::from_error(&unsaved);
        assert_eq!(reply.status, ReplyStatus::Failed);
        assert!(!reply.text.contains("try again"));
    }

    #[test]
    fn ingest_acks() {
        let appended: Result<IngestOutcome, DiaryError> =
            Ok(IngestOutcome::Appended(SessionRef {
                user_id: "ou_a".into(),
                diary_date: date(),
                event_count: 1,
            }));
        let reply = ingest_reply(&appended).unwrap();
        assert!(reply.text.contains("1 entry for 2025-03-14"));

        let dropped: Result<IngestOutcome, DiaryError> = Ok(IngestOutcome::Dropped {
            kind: "sticker".into(),
        });
        assert!(ingest_reply(&dropped).is_none());
    }

    #[test]
    fn reply_serializes_status_snake_case() {
        let reply = Reply::new(ReplyStatus::RetryLater, "later");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "retry_later");
    }
}
