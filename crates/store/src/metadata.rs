//! Durable metadata store backed by [`redb`].
//!
//! # Tables
//!
//! | Name                      | Key                     | Value                          |
//! |---------------------------|-------------------------|--------------------------------|
//! | `sessions`                | `user \x1f YYYY-MM-DD`  | JSON [`DiarySession`]          |
//! | `documents`               | UUID string (36c)       | JSON [`DiaryDocument`]         |
//! | `documents_by_owner`      | owner user id           | newline-joined UUID list       |
//! | `documents_by_day`        | `user \x1f YYYY-MM-DD`  | newline-joined UUID list       |
//! | `documents_by_remote_id`  | remote document id      | UUID string                    |
//!
//! Every write is a single redb transaction, so a row and its index entries
//! never disagree.  Callers serialize writes per key; the store itself only
//! guarantees per-call atomicity.
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use redb::{Database, ReadOnlyTable, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::schema::{DiaryDocument, DiarySession, DocumentStatus, SessionState, day_key};

// ── redb table definitions ────────────────────────────────────────────────────

const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const OWNER_INDEX: IdIndex = TableDefinition::new("documents_by_owner");
const DAY_INDEX: IdIndex = TableDefinition::new("documents_by_day");
const REMOTE_INDEX: IdIndex = TableDefinition::new("documents_by_remote_id");

type DocumentTable = ReadOnlyTable<&'static str, &'static [u8]>;
type IdIndex = TableDefinition<'static, &'static str, &'static str>;

// ── MetadataStore ─────────────────────────────────────────────────────────────

/// Handle to the sessions and documents tables.  Cheap to clone.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open or create the database file at `path`, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;
        debug!(path = %path.display(), "metadata store opened");
        Self::init(db)
    }

    /// Volatile store for tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = redb::Builder::new().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, StoreError> {
        // Ensure tables exist so read transactions never see a missing table.
        let tx = db.begin_write()?;
        tx.open_table(SESSIONS_TABLE)?;
        tx.open_table(DOCUMENTS_TABLE)?;
        tx.open_table(OWNER_INDEX)?;
        tx.open_table(DAY_INDEX)?;
        tx.open_table(REMOTE_INDEX)?;
        tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    pub fn get_session(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DiarySession>, StoreError> {
        let key = day_key(user_id, date);
        let tx = self.db.begin_read()?;
        let table = tx.open_table(SESSIONS_TABLE)?;
        let raw = table.get(key.as_str())?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_session(&self, session: &DiarySession) -> Result<(), StoreError> {
        let key = session.key();
        let bytes = serde_json::to_vec(session)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(SESSIONS_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Up to `limit` sessions of `user_id` dated within `from..=to` and
    /// strictly after `after`, oldest first.
    pub fn sessions_page(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        after: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<DiarySession>, StoreError> {
        let start_date = match after {
            Some(after) => match after.succ_opt() {
                Some(next) => next.max(from),
                None => return Ok(Vec::new()),
            },
            None => from,
        };
        if start_date > to || limit == 0 {
            return Ok(Vec::new());
        }

        let start = day_key(user_id, start_date);
        let end = day_key(user_id, to);
        let tx = self.db.begin_read()?;
        let table = tx.open_table(SESSIONS_TABLE)?;
        let mut page = Vec::new();
        for item in table.range(start.as_str()..=end.as_str())? {
            let (_, raw) = item?;
            page.push(serde_json::from_slice(raw.value())?);
            if page.len() >= limit {
                break;
            }
        }
        Ok(page)
    }

    // ── Documents ─────────────────────────────────────────────────────────

    /// Insert or overwrite a document row and keep all three indexes current.
    pub fn put_document(&self, doc: &DiaryDocument) -> Result<(), StoreError> {
        let id = doc.id.to_string();
        let bytes = serde_json::to_vec(doc)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(DOCUMENTS_TABLE)?;
            table.insert(id.as_str(), bytes.as_slice())?;
        }
        add_to_index(&tx, OWNER_INDEX, &doc.owner_user_id, &id)?;
        add_to_index(&tx, DAY_INDEX, &doc.day_key(), &id)?;
        if let Some(remote) = doc.document_id.as_deref() {
            let mut remote_tbl = tx.open_table(REMOTE_INDEX)?;
            remote_tbl.insert(remote, id.as_str())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_document(&self, id: Uuid) -> Result<Option<DiaryDocument>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(DOCUMENTS_TABLE)?;
        read_document(&table, &id.to_string())
    }

    pub fn document_by_remote_id(
        &self,
        document_id: &str,
    ) -> Result<Option<DiaryDocument>, StoreError> {
        let tx = self.db.begin_read()?;
        let remote_tbl = tx.open_table(REMOTE_INDEX)?;
        let id = remote_tbl.get(document_id)?.map(|v| v.value().to_string());
        let Some(id) = id else {
            return Ok(None);
        };
        let table = tx.open_table(DOCUMENTS_TABLE)?;
        read_document(&table, &id)
    }

    /// Every row owned by `user_id`, in insertion order.
    pub fn documents_for_owner(&self, user_id: &str) -> Result<Vec<DiaryDocument>, StoreError> {
        self.documents_via_index(OWNER_INDEX, user_id)
    }

    /// Every row for `(user_id, date)`, including superseded ones.
    pub fn documents_for_day(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DiaryDocument>, StoreError> {
        self.documents_via_index(DAY_INDEX, &day_key(user_id, date))
    }

    pub fn documents_with_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> Result<Vec<DiaryDocument>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(DOCUMENTS_TABLE)?;
        let mut docs = Vec::new();
        for item in table.iter()? {
            let (_, raw) = item?;
            let doc: DiaryDocument = serde_json::from_slice(raw.value())?;
            if statuses.contains(&doc.status) {
                docs.push(doc);
            }
        }
        docs.sort_by_key(|doc| doc.created_at);
        Ok(docs)
    }

    fn documents_via_index(
        &self,
        index: IdIndex,
        key: &str,
    ) -> Result<Vec<DiaryDocument>, StoreError> {
        let tx = self.db.begin_read()?;
        let index_tbl = tx.open_table(index)?;
        let ids = index_tbl
            .get(key)?
            .map(|v| v.value().to_string())
            .unwrap_or_default();
        let table = tx.open_table(DOCUMENTS_TABLE)?;
        let mut docs = Vec::new();
        for id in ids.lines().filter(|line| !line.is_empty()) {
            if let Some(doc) = read_document(&table, id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

fn read_document(table: &DocumentTable, id: &str) -> Result<Option<DiaryDocument>, StoreError> {
    match table.get(id)? {
        Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
        None => Ok(None),
    }
}

/// Append `id` to the newline-joined list under `key` unless already present.
fn add_to_index(
    tx: &WriteTransaction,
    index: IdIndex,
    key: &str,
    id: &str,
) -> Result<(), StoreError> {
    let mut table = tx.open_table(index)?;
    let existing = table
        .get(key)?
        .map(|v| v.value().to_string())
        .unwrap_or_default();
    if existing.lines().any(|line| line == id) {
        return Ok(());
    }
    let updated = if existing.is_empty() {
        id.to_string()
    } else {
        format!("{existing}\n{id}")
    };
    table.insert(key, updated.as_str())?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
