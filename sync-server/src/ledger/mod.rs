//! History ledger: append-only valid-time intervals per entity
//!
//! # Architecture
//!
//! ```text
//! open_history index ──► history[id]  (valid_to = None)
//!                           │
//!                           ├─ prev_hash ─► history[id'] (closed) ─► ... ─► genesis
//!                           └─ open_children ─► child_history[cid] (valid_to = None)
//! ```
//!
//! # Guarantees
//!
//! - **At most one open version per entity**: the `open_history` index holds a
//!   single id per entity; `open` refuses to create a second one.
//! - **Contiguous intervals**: a superseding version starts exactly where the
//!   closed one ends. Gaps appear only where an entity was retired and later
//!   observed again.
//! - **Tamper evidence**: SHA256 chain per entity, checked by [`HistoryLedger::verify`].
//! - **Corruption is fatal**: a missing or dangling open version aborts the
//!   caller's transaction instead of being papered over.

mod hash;
mod types;

pub use types::{ChainBreak, ChainVerification, ChildHistoryRecord, HistoryRecord, Supersession};

use redb::{ReadableTable, WriteTransaction};
use serde_json::Value;
use shared::{ChildItem, Record};
use std::collections::BTreeMap;

use crate::store::{
    CHILD_HISTORY_SEQ, CHILD_HISTORY_TABLE, ENTITY_VERSIONS_TABLE, EntityRef, HISTORY_SEQ,
    HISTORY_TABLE, Inconsistency, InventoryStore, OPEN_CHILDREN_TABLE, OPEN_HISTORY_TABLE,
    PARENT_CHILDREN_TABLE, StorageError, StorageResult,
};
use crate::sync::diff::Diff;

use hash::{GENESIS, compute_version_hash, expected_hash};

/// Bitemporal version ledger
///
/// Mutating operations run inside the caller's transaction; read operations
/// open their own read transaction.
#[derive(Clone)]
pub struct HistoryLedger {
    store: InventoryStore,
}

impl HistoryLedger {
    pub fn new(store: InventoryStore) -> Self {
        Self { store }
    }

    // ========== Mutations (within transaction) ==========

    /// Open a version for an entity with no live snapshot at `now`
    ///
    /// An entity retired earlier and observed again continues its old chain:
    /// `prev_hash` links to the last closed version and `first_collected_at`
    /// is carried forward.
    pub fn open(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
        record: &Record,
        now: i64,
    ) -> StorageResult<HistoryRecord> {
        if let Some(id) = open_version_id(txn, entity)? {
            return Err(StorageError::corruption(
                entity,
                format!("open requested but version {id} is already open"),
            ));
        }

        let (prev_hash, first_collected_at) = match latest_version(txn, entity)? {
            Some(last) if last.is_open() => {
                return Err(StorageError::corruption(
                    entity,
                    format!("version {} is open but missing from the index", last.id),
                ));
            }
            Some(last) => (last.curr_hash, last.first_collected_at),
            None => (GENESIS.to_string(), record.collected_at),
        };

        let version = append_version(
            txn,
            entity,
            &record.fields,
            record.collected_at,
            first_collected_at,
            now,
            &prev_hash,
        )?;
        open_children(txn, entity, version.id, children_of(&record.children, None), now)?;
        Ok(version)
    }

    /// Record a change of an existing entity at `now`
    ///
    /// Core-field changes close the open version (and its children) and open
    /// a new one carrying `first_collected_at` forward. Child-only changes
    /// close and reopen the affected child collections under the same parent.
    pub fn supersede(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
        record: &Record,
        diff: &Diff,
        now: i64,
    ) -> StorageResult<Supersession> {
        let Some(mut current) = load_open(txn, entity)? else {
            return Err(StorageError::corruption(
                entity,
                "supersede requested but no version is open",
            ));
        };

        if diff.is_changed {
            close_version(txn, entity, &mut current, now)?;
            let next = append_version(
                txn,
                entity,
                &record.fields,
                record.collected_at,
                current.first_collected_at,
                now,
                &current.curr_hash,
            )?;
            open_children(txn, entity, next.id, children_of(&record.children, None), now)?;
            return Ok(Supersession::Replaced {
                closed: current.id,
                opened: next.id,
            });
        }

        let mut collections = 0;
        for collection in diff.changed_collections() {
            close_children(txn, entity, current.id, Some(collection), now)?;
            open_children(
                txn,
                entity,
                current.id,
                children_of(&record.children, Some(collection)),
                now,
            )?;
            collections += 1;
        }

        if collections == 0 {
            Ok(Supersession::Unchanged)
        } else {
            Ok(Supersession::ChildrenOnly {
                parent: current.id,
                collections,
            })
        }
    }

    /// Close the open version without replacement
    ///
    /// Returns `None` if nothing is open: deleting twice is not an error.
    pub fn close(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
        now: i64,
    ) -> StorageResult<Option<HistoryRecord>> {
        let Some(mut current) = load_open(txn, entity)? else {
            return Ok(None);
        };
        close_version(txn, entity, &mut current, now)?;
        Ok(Some(current))
    }

    // ========== Queries (read-only) ==========

    /// All versions of an entity, oldest first
    pub fn versions(&self, entity: EntityRef<'_>) -> StorageResult<Vec<HistoryRecord>> {
        let read_txn = self.store.begin_read()?;
        let index = read_txn.open_table(ENTITY_VERSIONS_TABLE)?;
        let history = read_txn.open_table(HISTORY_TABLE)?;

        let start = (entity.kind, entity.scope, entity.key, 0u64);
        let end = (entity.kind, entity.scope, entity.key, u64::MAX);

        let mut versions = Vec::new();
        for result in index.range(start..=end)? {
            let (key, _) = result?;
            let id = key.value().3;
            match history.get(id)? {
                Some(guard) => versions.push(serde_json::from_slice(guard.value())?),
                None => {
                    return Err(StorageError::corruption(
                        entity,
                        format!("version index points at missing version {id}"),
                    ));
                }
            }
        }
        Ok(versions)
    }

    /// The currently open version, if any (via the open-interval index)
    pub fn open_version(&self, entity: EntityRef<'_>) -> StorageResult<Option<HistoryRecord>> {
        let read_txn = self.store.begin_read()?;
        let index = read_txn.open_table(OPEN_HISTORY_TABLE)?;
        let history = read_txn.open_table(HISTORY_TABLE)?;

        let Some(id) = index.get(entity.table_key())?.map(|g| g.value()) else {
            return Ok(None);
        };
        match history.get(id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Number of versions with `valid_to = None` (counted from the ledger
    /// itself, not the index)
    pub fn open_count(&self, entity: EntityRef<'_>) -> StorageResult<usize> {
        Ok(self
            .versions(entity)?
            .iter()
            .filter(|v| v.is_open())
            .count())
    }

    /// Child versions owned by one parent version, oldest first
    pub fn children(&self, parent_id: u64) -> StorageResult<Vec<ChildHistoryRecord>> {
        let read_txn = self.store.begin_read()?;
        let index = read_txn.open_table(PARENT_CHILDREN_TABLE)?;
        let history = read_txn.open_table(CHILD_HISTORY_TABLE)?;

        let mut children = Vec::new();
        for result in index.range((parent_id, 0u64)..=(parent_id, u64::MAX))? {
            let (key, _) = result?;
            let child_id = key.value().1;
            if let Some(guard) = history.get(child_id)? {
                children.push(serde_json::from_slice(guard.value())?);
            }
        }
        Ok(children)
    }

    /// Verify the hash chain and interval structure of one entity
    pub fn verify(&self, entity: EntityRef<'_>) -> StorageResult<ChainVerification> {
        let versions = self.versions(entity)?;
        let mut breaks = Vec::new();
        let mut prev: Option<&HistoryRecord> = None;

        for version in &versions {
            let expected_prev = prev.map(|p| p.curr_hash.as_str()).unwrap_or(GENESIS);
            if version.prev_hash != expected_prev {
                breaks.push(ChainBreak {
                    version_id: version.id,
                    reason: format!(
                        "prev_hash mismatch: expected {expected_prev}, found {}",
                        version.prev_hash
                    ),
                });
            }
            if version.curr_hash != expected_hash(version)? {
                breaks.push(ChainBreak {
                    version_id: version.id,
                    reason: "content does not match curr_hash".to_string(),
                });
            }
            if let Some(valid_to) = version.valid_to
                && valid_to < version.valid_from
            {
                breaks.push(ChainBreak {
                    version_id: version.id,
                    reason: format!("inverted interval [{}, {valid_to})", version.valid_from),
                });
            }
            if let Some(p) = prev {
                // 退役后重新出现会留下空档，重叠则不允许
                if !p.valid_to.is_some_and(|to| to <= version.valid_from) {
                    breaks.push(ChainBreak {
                        version_id: version.id,
                        reason: format!(
                            "overlap: previous valid_to={:?}, valid_from={}",
                            p.valid_to, version.valid_from
                        ),
                    });
                }
                if p.first_collected_at != version.first_collected_at {
                    breaks.push(ChainBreak {
                        version_id: version.id,
                        reason: "first_collected_at changed between versions".to_string(),
                    });
                }
            }
            prev = Some(version);
        }

        let open_versions = versions.iter().filter(|v| v.is_open()).count();
        if open_versions > 1 {
            for version in versions.iter().filter(|v| v.is_open()).skip(1) {
                breaks.push(ChainBreak {
                    version_id: version.id,
                    reason: "more than one open version".to_string(),
                });
            }
        }

        Ok(ChainVerification {
            total_versions: versions.len(),
            open_versions,
            chain_intact: breaks.is_empty(),
            breaks,
        })
    }

    /// Check the commit-boundary invariants for every entity of a kind in a
    /// scope: each live snapshot has exactly one open version whose fields
    /// equal the snapshot's, and no open version outlives its snapshot.
    pub fn check_consistency(&self, kind: &str, scope: &str) -> StorageResult<Vec<Inconsistency>> {
        let mut issues = Vec::new();
        let snapshots = self.store.list_snapshots(kind, scope)?;

        for snapshot in &snapshots {
            let entity = snapshot.entity();
            match self.open_version(entity)? {
                None => issues.push(Inconsistency::MissingOpenVersion {
                    key: snapshot.key.clone(),
                }),
                Some(version) if version.fields != snapshot.fields => {
                    issues.push(Inconsistency::FieldMismatch {
                        key: snapshot.key.clone(),
                        version_id: version.id,
                    });
                }
                Some(_) => {}
            }
        }

        let read_txn = self.store.begin_read()?;
        let index = read_txn.open_table(OPEN_HISTORY_TABLE)?;
        for result in index.range((kind, scope, "")..)? {
            let (key, value) = result?;
            let (k_kind, k_scope, k_key) = key.value();
            if k_kind != kind || k_scope != scope {
                break;
            }
            if !snapshots.iter().any(|s| s.key == k_key) {
                issues.push(Inconsistency::OrphanOpenVersion {
                    key: k_key.to_string(),
                    version_id: value.value(),
                });
            }
        }

        Ok(issues)
    }
}

// ========== Internal helpers ==========

fn children_of<'c>(
    children: &'c BTreeMap<String, Vec<ChildItem>>,
    only: Option<&'c str>,
) -> impl Iterator<Item = (&'c str, &'c ChildItem)> + 'c {
    children
        .iter()
        .filter(move |(collection, _)| only.is_none_or(|c| c == collection.as_str()))
        .flat_map(|(collection, items)| items.iter().map(move |item| (collection.as_str(), item)))
}

fn open_version_id(txn: &WriteTransaction, entity: EntityRef<'_>) -> StorageResult<Option<u64>> {
    let index = txn.open_table(OPEN_HISTORY_TABLE)?;
    Ok(index.get(entity.table_key())?.map(|guard| guard.value()))
}

/// Most recent version of an entity, open or closed
fn latest_version(
    txn: &WriteTransaction,
    entity: EntityRef<'_>,
) -> StorageResult<Option<HistoryRecord>> {
    let id = {
        let index = txn.open_table(ENTITY_VERSIONS_TABLE)?;
        let start = (entity.kind, entity.scope, entity.key, 0u64);
        let end = (entity.kind, entity.scope, entity.key, u64::MAX);
        match index.range(start..=end)?.next_back() {
            Some(result) => result?.0.value().3,
            None => return Ok(None),
        }
    };

    let history = txn.open_table(HISTORY_TABLE)?;
    match history.get(id)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Err(StorageError::corruption(
            entity,
            format!("version index points at missing version {id}"),
        )),
    }
}

/// Follow the open-interval index; a dangling or closed target is corruption
fn load_open(txn: &WriteTransaction, entity: EntityRef<'_>) -> StorageResult<Option<HistoryRecord>> {
    let Some(id) = open_version_id(txn, entity)? else {
        return Ok(None);
    };

    let history = txn.open_table(HISTORY_TABLE)?;
    let version: HistoryRecord = match history.get(id)? {
        Some(guard) => serde_json::from_slice(guard.value())?,
        None => {
            return Err(StorageError::corruption(
                entity,
                format!("open index points at missing version {id}"),
            ));
        }
    };

    if !version.is_open() {
        return Err(StorageError::corruption(
            entity,
            format!("open index points at closed version {id}"),
        ));
    }
    if version.resource_id != entity.key || version.kind != entity.kind || version.scope != entity.scope {
        return Err(StorageError::corruption(
            entity,
            format!("open index points at version {id} of another entity"),
        ));
    }
    Ok(Some(version))
}

fn append_version(
    txn: &WriteTransaction,
    entity: EntityRef<'_>,
    fields: &BTreeMap<String, Value>,
    collected_at: i64,
    first_collected_at: i64,
    valid_from: i64,
    prev_hash: &str,
) -> StorageResult<HistoryRecord> {
    let id = InventoryStore::next_sequence(txn, HISTORY_SEQ)?;
    let curr_hash = compute_version_hash(
        prev_hash,
        id,
        entity.kind,
        entity.scope,
        entity.key,
        fields,
        collected_at,
        first_collected_at,
        valid_from,
    )?;

    let version = HistoryRecord {
        id,
        kind: entity.kind.to_string(),
        scope: entity.scope.to_string(),
        resource_id: entity.key.to_string(),
        fields: fields.clone(),
        collected_at,
        first_collected_at,
        valid_from,
        valid_to: None,
        prev_hash: prev_hash.to_string(),
        curr_hash,
    };

    let value = serde_json::to_vec(&version)?;
    txn.open_table(HISTORY_TABLE)?.insert(id, value.as_slice())?;
    txn.open_table(ENTITY_VERSIONS_TABLE)?
        .insert((entity.kind, entity.scope, entity.key, id), ())?;
    txn.open_table(OPEN_HISTORY_TABLE)?
        .insert(entity.table_key(), id)?;

    Ok(version)
}

fn close_version(
    txn: &WriteTransaction,
    entity: EntityRef<'_>,
    version: &mut HistoryRecord,
    now: i64,
) -> StorageResult<()> {
    if now < version.valid_from {
        return Err(StorageError::InvertedInterval {
            entity: entity.to_string(),
            valid_from: version.valid_from,
            valid_to: now,
        });
    }

    version.valid_to = Some(now);
    let value = serde_json::to_vec(&*version)?;
    txn.open_table(HISTORY_TABLE)?
        .insert(version.id, value.as_slice())?;
    txn.open_table(OPEN_HISTORY_TABLE)?
        .remove(entity.table_key())?;

    close_children(txn, entity, version.id, None, now)?;
    Ok(())
}

fn open_children<'c>(
    txn: &WriteTransaction,
    entity: EntityRef<'_>,
    parent_id: u64,
    items: impl Iterator<Item = (&'c str, &'c ChildItem)>,
    now: i64,
) -> StorageResult<usize> {
    let mut history = txn.open_table(CHILD_HISTORY_TABLE)?;
    let mut open = txn.open_table(OPEN_CHILDREN_TABLE)?;
    let mut by_parent = txn.open_table(PARENT_CHILDREN_TABLE)?;

    let mut opened = 0;
    for (collection, item) in items {
        let id = InventoryStore::next_sequence(txn, CHILD_HISTORY_SEQ)?;
        let child = ChildHistoryRecord {
            id,
            parent_id,
            collection: collection.to_string(),
            child_key: item.key.clone(),
            value: item.value.clone(),
            valid_from: now,
            valid_to: None,
        };
        let value = serde_json::to_vec(&child)?;
        history.insert(id, value.as_slice())?;
        by_parent.insert((parent_id, id), ())?;

        let previous = open
            .insert((parent_id, collection, item.key.as_str()), id)?
            .map(|guard| guard.value());
        if let Some(previous) = previous {
            return Err(StorageError::corruption(
                entity,
                format!(
                    "child {collection}/{} of version {parent_id} already open as {previous}",
                    item.key
                ),
            ));
        }
        opened += 1;
    }
    Ok(opened)
}

fn close_children(
    txn: &WriteTransaction,
    entity: EntityRef<'_>,
    parent_id: u64,
    collection: Option<&str>,
    now: i64,
) -> StorageResult<usize> {
    let mut open = txn.open_table(OPEN_CHILDREN_TABLE)?;
    let mut history = txn.open_table(CHILD_HISTORY_TABLE)?;

    let mut targets: Vec<(String, String, u64)> = Vec::new();
    for result in open.range((parent_id, collection.unwrap_or(""), "")..)? {
        let (key, value) = result?;
        let (pid, coll, child_key) = key.value();
        if pid != parent_id {
            break;
        }
        if let Some(only) = collection
            && coll != only
        {
            break;
        }
        targets.push((coll.to_string(), child_key.to_string(), value.value()));
    }

    for (coll, child_key, child_id) in &targets {
        let mut child: ChildHistoryRecord = match history.get(*child_id)? {
            Some(guard) => serde_json::from_slice(guard.value())?,
            None => {
                return Err(StorageError::corruption(
                    entity,
                    format!("open child index points at missing child {child_id}"),
                ));
            }
        };
        if now < child.valid_from {
            return Err(StorageError::InvertedInterval {
                entity: entity.to_string(),
                valid_from: child.valid_from,
                valid_to: now,
            });
        }
        child.valid_to = Some(now);
        let value = serde_json::to_vec(&child)?;
        history.insert(*child_id, value.as_slice())?;
        open.remove((parent_id, coll.as_str(), child_key.as_str()))?;
    }
    Ok(targets.len())
}

// ========== Fault injection (tests only) ==========

#[cfg(test)]
impl HistoryLedger {
    /// Drop the open-interval index entry, leaving the version itself open
    pub(crate) fn drop_open_index(&self, entity: EntityRef<'_>) -> StorageResult<()> {
        let txn = self.store.begin_write()?;
        txn.open_table(OPEN_HISTORY_TABLE)?
            .remove(entity.table_key())?;
        txn.commit()?;
        Ok(())
    }

    /// Overwrite a stored version's fields without recomputing its hash
    pub(crate) fn tamper_fields(
        &self,
        version_id: u64,
        fields: BTreeMap<String, Value>,
    ) -> StorageResult<()> {
        let txn = self.store.begin_write()?;
        {
            let mut history = txn.open_table(HISTORY_TABLE)?;
            let mut version: HistoryRecord = match history.get(version_id)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Ok(()),
            };
            version.fields = fields;
            let value = serde_json::to_vec(&version)?;
            history.insert(version_id, value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}
