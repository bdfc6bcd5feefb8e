//! Diary data model and the durable metadata store.
//!
//! The store is the single source of truth for session lifecycle and
//! document state; the remote document service is only a mirror of it.
pub mod error;
pub mod metadata;
pub mod schema;

pub use error::StoreError;
pub use metadata::MetadataStore;
pub use schema::{
    DeletionReason, DiaryDocument, DiaryEvent, DiarySession, DocumentStatus, EventKind,
    SessionOutcome, SessionState, content_digest, day_key,
};
