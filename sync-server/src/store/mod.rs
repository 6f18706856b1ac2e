//! redb-based inventory store
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `snapshots` | `(kind, scope, key)` | `SnapshotRow` | Current state per entity |
//! | `snapshot_children` | `(kind, scope, key, collection, child_key)` | JSON value | Current child collections |
//! | `history` | `id` | `HistoryRecord` | Version ledger (append-only, closed once) |
//! | `entity_versions` | `(kind, scope, key, id)` | `()` | Versions per entity |
//! | `open_history` | `(kind, scope, key)` | `id` | The single open version per entity |
//! | `child_history` | `id` | `ChildHistoryRecord` | Child version ledger |
//! | `open_children` | `(parent_id, collection, child_key)` | `child_id` | Open child versions |
//! | `parent_children` | `(parent_id, child_id)` | `()` | Child versions per parent |
//! | `sequences` | name | `u64` | Surrogate id counters |
//! | `sync_state` | `(kind, scope)` | `i64` | Last successful collected_at |
//!
//! # Transactions
//!
//! Every mutating operation takes the caller's `WriteTransaction`; nothing in
//! this module commits on its own except the test helpers. Dropping or
//! aborting the transaction discards every mutation made through it.

mod snapshot;
mod types;

pub use snapshot::Inconsistency;
pub use types::{EntityRef, Snapshot};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub(crate) type EntityKey = (&'static str, &'static str, &'static str);
pub(crate) type ChildKey = (
    &'static str,
    &'static str,
    &'static str,
    &'static str,
    &'static str,
);

pub(crate) const SNAPSHOTS_TABLE: TableDefinition<EntityKey, &[u8]> =
    TableDefinition::new("snapshots");

pub(crate) const SNAPSHOT_CHILDREN_TABLE: TableDefinition<ChildKey, &[u8]> =
    TableDefinition::new("snapshot_children");

pub(crate) const HISTORY_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("history");

pub(crate) const ENTITY_VERSIONS_TABLE: TableDefinition<(&str, &str, &str, u64), ()> =
    TableDefinition::new("entity_versions");

pub(crate) const OPEN_HISTORY_TABLE: TableDefinition<EntityKey, u64> =
    TableDefinition::new("open_history");

pub(crate) const CHILD_HISTORY_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("child_history");

pub(crate) const OPEN_CHILDREN_TABLE: TableDefinition<(u64, &str, &str), u64> =
    TableDefinition::new("open_children");

pub(crate) const PARENT_CHILDREN_TABLE: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("parent_children");

const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const SYNC_STATE_TABLE: TableDefinition<(&str, &str), i64> = TableDefinition::new("sync_state");

pub(crate) const HISTORY_SEQ: &str = "history";
pub(crate) const CHILD_HISTORY_SEQ: &str = "child_history";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The open-interval index disagrees with the ledger (zero or two open
    /// versions, dangling ids). Never retried automatically.
    #[error("Ledger corruption for {entity}: {detail}")]
    LedgerCorruption { entity: String, detail: String },

    #[error("Interval for {entity} would end before it starts: valid_from={valid_from}, valid_to={valid_to}")]
    InvertedInterval {
        entity: String,
        valid_from: i64,
        valid_to: i64,
    },
}

impl StorageError {
    pub(crate) fn corruption(entity: EntityRef<'_>, detail: impl Into<String>) -> Self {
        StorageError::LedgerCorruption {
            entity: entity.to_string(),
            detail: detail.into(),
        }
    }

    /// Data-integrity fault, as opposed to an ordinary transient failure
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            StorageError::LedgerCorruption { .. } | StorageError::InvertedInterval { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Inventory storage backed by redb
#[derive(Clone)]
pub struct InventoryStore {
    db: Arc<Database>,
}

impl InventoryStore {
    /// Open or create the database at the given path
    ///
    /// redb commits are durable as soon as `commit()` returns (copy-on-write
    /// with atomic pointer swap), so a crash mid-pass loses the pass, never
    /// half of it.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            // Create all tables if they don't exist
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(SNAPSHOT_CHILDREN_TABLE)?;
            let _ = write_txn.open_table(HISTORY_TABLE)?;
            let _ = write_txn.open_table(ENTITY_VERSIONS_TABLE)?;
            let _ = write_txn.open_table(OPEN_HISTORY_TABLE)?;
            let _ = write_txn.open_table(CHILD_HISTORY_TABLE)?;
            let _ = write_txn.open_table(OPEN_CHILDREN_TABLE)?;
            let _ = write_txn.open_table(PARENT_CHILDREN_TABLE)?;
            let _ = write_txn.open_table(SYNC_STATE_TABLE)?;
            let _ = write_txn.open_table(SEQUENCE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Begin a write transaction
    ///
    /// redb serializes writers: this blocks while another write transaction
    /// is open. Callers must not hold a transaction across an `.await`.
    pub fn begin_write(&self) -> StorageResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub(crate) fn begin_read(&self) -> StorageResult<redb::ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    // ========== Sequence Operations ==========

    /// Increment and return the named sequence (within transaction)
    pub(crate) fn next_sequence(txn: &WriteTransaction, name: &str) -> StorageResult<u64> {
        let mut table = txn.open_table(SEQUENCE_TABLE)?;
        let current = table.get(name)?.map(|guard| guard.value()).unwrap_or(0);
        let next = current + 1;
        table.insert(name, next)?;
        Ok(next)
    }

    // ========== Sync State ==========

    /// collected_at of the last committed pass for `(kind, scope)`
    pub fn last_success(&self, kind: &str, scope: &str) -> StorageResult<Option<i64>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SYNC_STATE_TABLE)?;
        Ok(table.get((kind, scope))?.map(|guard| guard.value()))
    }

    /// Record the pass timestamp; commits together with the batch
    pub fn record_success(
        &self,
        txn: &WriteTransaction,
        kind: &str,
        scope: &str,
        collected_at: i64,
    ) -> StorageResult<()> {
        let mut table = txn.open_table(SYNC_STATE_TABLE)?;
        table.insert((kind, scope), collected_at)?;
        Ok(())
    }
}
