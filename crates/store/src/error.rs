use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database open failed: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table access failed: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage failure: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit failed: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
