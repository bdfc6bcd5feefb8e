//! Session aggregation and document consistency for the diary bot.
//!
//! Inbound messages are normalized into [`DiaryEvent`]s and buffered per
//! user and calendar day by the [`SessionStore`].  Aggregation closes a
//! session, runs the [`Summarizer`] once, and hands the result to the
//! [`DocumentSyncEngine`], which keeps the local metadata rows and the
//! remote document store converging.  Each entry may get a short
//! follow-up question from the [`FollowUpWriter`].
//!
//! [`DiaryEvent`]: diarist_store::DiaryEvent
pub mod commands;
pub mod error;
pub mod follow_up;
pub mod lock;
pub mod normalizer;
pub mod retry;
pub mod service;
pub mod session;
pub mod storage;
pub mod summarizer;
pub mod sync;
pub mod tz;

#[cfg(test)]
pub(crate) mod testing;

pub use commands::{Command, DEFAULT_HISTORY_DAYS, HELP_TEXT, Reply, ReplyStatus, ingest_reply};
pub use error::{
    DiaryError, ErrorKind, NormalizeError, SessionError, StorageError, SummarizeError, SyncError,
};
pub use follow_up::FollowUpWriter;
pub use normalizer::{Normalizer, RawMessage};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};
pub use service::{DiaryService, IngestOutcome};
pub use session::{OpenedSession, SessionRef, SessionStore, history_start};
pub use storage::BoundedStore;
pub use summarizer::{StructuredDiaryText, Summarizer};
pub use sync::{
    CleanupReport, DeleteOutcome, DocumentApi, DocumentListing, DocumentSyncEngine,
    NotifyOutcome, RemoteDocument, RemoteError, RemoteTeardown, SweepReport, SyncOutcome,
};
pub use tz::TimezoneResolver;
