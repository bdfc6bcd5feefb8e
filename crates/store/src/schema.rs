use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    VoiceTranscript,
    ImageRef,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::VoiceTranscript => "voice",
            Self::ImageRef => "image",
        }
    }
}

/// One normalized inbound message.  Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiaryEvent {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Text content, transcript, or an opaque media reference.
    pub payload: String,
    /// Human-readable label for media references (e.g. the image file name).
    #[serde(default)]
    pub caption: Option<String>,
    /// Arrival sequence number; breaks timestamp ties.
    pub seq: u64,
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Aggregating,
    Closed,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Aggregating => "aggregating",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Summarized,
    SummaryFailed { reason: String },
}

/// All of one user's events for one calendar day in their timezone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiarySession {
    pub user_id: String,
    pub diary_date: NaiveDate,
    pub events: Vec<DiaryEvent>,
    pub state: SessionState,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiarySession {
    pub fn open(user_id: impl Into<String>, diary_date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            diary_date,
            events: Vec::new(),
            state: SessionState::Open,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        day_key(&self.user_id, self.diary_date)
    }

    /// Events in aggregation order: timestamp, then arrival sequence.
    pub fn ordered_events(&self) -> Vec<DiaryEvent> {
        let mut events = self.events.clone();
        events.sort_by_key(|event| (event.timestamp, event.seq));
        events
    }
}

/// Composite `(user, date)` key.  ISO dates keep per-user keys in date order.
pub fn day_key(user_id: &str, date: NaiveDate) -> String {
    format!("{user_id}\u{1f}{}", date.format("%Y-%m-%d"))
}

// ── Documents ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Active,
    Orphaned,
    Deleted,
}

impl DocumentStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Orphaned => "orphaned",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    LocalDelete,
    Cleanup,
    RemoteDeleted,
    RemoteMissing,
    CreationFailed,
    Cancelled,
}

impl DeletionReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::LocalDelete => "local_delete",
            Self::Cleanup => "cleanup",
            Self::RemoteDeleted => "remote_deleted",
            Self::RemoteMissing => "remote_missing",
            Self::CreationFailed => "creation_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Local record of a diary document and its remote mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiaryDocument {
    pub id: Uuid,
    /// Remote identifier, assigned once remote creation succeeds.
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub owner_user_id: String,
    pub diary_date: NaiveDate,
    pub title: String,
    /// Rendered markdown, kept so a pending row can be retried.
    pub content: String,
    /// SHA-256 hex of `content`.
    pub content_digest: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permission_warning: Option<String>,
    #[serde(default)]
    pub deletion_reason: Option<DeletionReason>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiaryDocument {
    pub fn pending(
        owner_user_id: impl Into<String>,
        diary_date: NaiveDate,
        title: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            document_id: None,
            url: None,
            owner_user_id: owner_user_id.into(),
            diary_date,
            title: title.into(),
            content_digest: content_digest(&content),
            content,
            status: DocumentStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            permission_warning: None,
            deletion_reason: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn day_key(&self) -> String {
        day_key(&self.owner_user_id, self.diary_date)
    }

    /// Whether the row still points at something the user sees as theirs.
    pub fn is_live(&self) -> bool {
        matches!(self.status, DocumentStatus::Pending | DocumentStatus::Active)
    }

    pub fn mark_deleted(&mut self, reason: DeletionReason, now: DateTime<Utc>) {
        self.status = DocumentStatus::Deleted;
        self.deletion_reason = Some(reason);
        self.next_attempt_at = None;
        self.updated_at = now;
    }
}

/// SHA-256 hex digest used for idempotence checks on rendered content.
pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
