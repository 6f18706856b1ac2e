//! Snapshot operations: the single current-state row per entity
//!
//! Child collections are stored one row per child and are always replaced
//! wholesale (delete-then-reinsert), never merged.

use redb::{ReadableTable, Table, WriteTransaction};
use serde_json::Value;
use shared::{ChildItem, Record};
use std::collections::BTreeMap;

use super::types::SnapshotRow;
use super::{
    ChildKey, EntityKey, EntityRef, InventoryStore, SNAPSHOT_CHILDREN_TABLE, SNAPSHOTS_TABLE,
    Snapshot, StorageResult,
};

impl InventoryStore {
    /// Load a snapshot (within transaction)
    pub fn load_snapshot(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
    ) -> StorageResult<Option<Snapshot>> {
        let snapshots = txn.open_table(SNAPSHOTS_TABLE)?;
        let children = txn.open_table(SNAPSHOT_CHILDREN_TABLE)?;
        read_snapshot(&snapshots, &children, entity)
    }

    /// Get a snapshot (read-only, outside transaction)
    pub fn get_snapshot(&self, entity: EntityRef<'_>) -> StorageResult<Option<Snapshot>> {
        let read_txn = self.begin_read()?;
        let snapshots = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let children = read_txn.open_table(SNAPSHOT_CHILDREN_TABLE)?;
        read_snapshot(&snapshots, &children, entity)
    }

    /// Insert a new snapshot or overwrite every domain field of an existing
    /// one. Child rows are deleted and reinserted from `record`.
    pub fn upsert_snapshot(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
        record: &Record,
        first_collected_at: i64,
    ) -> StorageResult<()> {
        let row = SnapshotRow {
            fields: record.fields.clone(),
            collected_at: record.collected_at,
            first_collected_at,
        };
        let value = serde_json::to_vec(&row)?;
        {
            let mut table = txn.open_table(SNAPSHOTS_TABLE)?;
            table.insert(entity.table_key(), value.as_slice())?;
        }

        let mut children = txn.open_table(SNAPSHOT_CHILDREN_TABLE)?;
        remove_children(&mut children, entity)?;
        for (collection, items) in &record.children {
            for item in items {
                let value = serde_json::to_vec(&item.value)?;
                children.insert(
                    (
                        entity.kind,
                        entity.scope,
                        entity.key,
                        collection.as_str(),
                        item.key.as_str(),
                    ),
                    value.as_slice(),
                )?;
            }
        }
        Ok(())
    }

    /// Advance `collected_at` only. Returns false if the snapshot is missing.
    pub fn touch_snapshot(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
        collected_at: i64,
    ) -> StorageResult<bool> {
        let mut table = txn.open_table(SNAPSHOTS_TABLE)?;
        let row: Option<SnapshotRow> = match table.get(entity.table_key())? {
            Some(guard) => Some(serde_json::from_slice(guard.value())?),
            None => None,
        };
        let Some(mut row) = row else {
            return Ok(false);
        };
        row.collected_at = collected_at;
        let value = serde_json::to_vec(&row)?;
        table.insert(entity.table_key(), value.as_slice())?;
        Ok(true)
    }

    /// Remove a snapshot and its child rows. Returns false if it did not exist.
    pub fn delete_snapshot(
        &self,
        txn: &WriteTransaction,
        entity: EntityRef<'_>,
    ) -> StorageResult<bool> {
        let existed = {
            let mut table = txn.open_table(SNAPSHOTS_TABLE)?;
            table.remove(entity.table_key())?.is_some()
        };
        let mut children = txn.open_table(SNAPSHOT_CHILDREN_TABLE)?;
        remove_children(&mut children, entity)?;
        Ok(existed)
    }

    /// All snapshots of one kind within a scope (read-only)
    pub fn list_snapshots(&self, kind: &str, scope: &str) -> StorageResult<Vec<Snapshot>> {
        let read_txn = self.begin_read()?;
        let snapshots = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let children = read_txn.open_table(SNAPSHOT_CHILDREN_TABLE)?;

        let mut keys = Vec::new();
        for result in snapshots.range((kind, scope, "")..)? {
            let (key, _value) = result?;
            let (k_kind, k_scope, k_key) = key.value();
            if k_kind != kind || k_scope != scope {
                break;
            }
            keys.push(k_key.to_string());
        }

        let mut out = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(snapshot) =
                read_snapshot(&snapshots, &children, EntityRef::new(kind, scope, key))?
            {
                out.push(snapshot);
            }
        }
        Ok(out)
    }

    /// Keys of snapshots in scope whose `collected_at` is older than `cutoff`
    pub fn stale_keys(&self, kind: &str, scope: &str, cutoff: i64) -> StorageResult<Vec<String>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;

        let mut keys = Vec::new();
        for result in table.range((kind, scope, "")..)? {
            let (key, value) = result?;
            let (k_kind, k_scope, k_key) = key.value();
            if k_kind != kind || k_scope != scope {
                break;
            }
            let row: SnapshotRow = serde_json::from_slice(value.value())?;
            if row.collected_at < cutoff {
                keys.push(k_key.to_string());
            }
        }
        Ok(keys)
    }
}

/// Snapshot-vs-ledger mismatch found at a commit boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// Live snapshot without an open version
    MissingOpenVersion { key: String },
    /// Open version without a live snapshot
    OrphanOpenVersion { key: String, version_id: u64 },
    /// Snapshot fields differ from the open version's fields
    FieldMismatch { key: String, version_id: u64 },
}

fn read_snapshot<S, C>(
    snapshots: &S,
    children: &C,
    entity: EntityRef<'_>,
) -> StorageResult<Option<Snapshot>>
where
    S: ReadableTable<EntityKey, &'static [u8]>,
    C: ReadableTable<ChildKey, &'static [u8]>,
{
    let row: SnapshotRow = match snapshots.get(entity.table_key())? {
        Some(guard) => serde_json::from_slice(guard.value())?,
        None => return Ok(None),
    };

    Ok(Some(Snapshot {
        kind: entity.kind.to_string(),
        scope: entity.scope.to_string(),
        key: entity.key.to_string(),
        fields: row.fields,
        children: read_children(children, entity)?,
        collected_at: row.collected_at,
        first_collected_at: row.first_collected_at,
    }))
}

fn read_children<C>(
    table: &C,
    entity: EntityRef<'_>,
) -> StorageResult<BTreeMap<String, Vec<ChildItem>>>
where
    C: ReadableTable<ChildKey, &'static [u8]>,
{
    let mut children: BTreeMap<String, Vec<ChildItem>> = BTreeMap::new();
    let start = (entity.kind, entity.scope, entity.key, "", "");

    for result in table.range(start..)? {
        let (key, value) = result?;
        let (kind, scope, entity_key, collection, child_key) = key.value();
        if kind != entity.kind || scope != entity.scope || entity_key != entity.key {
            break;
        }
        let value: Value = serde_json::from_slice(value.value())?;
        children
            .entry(collection.to_string())
            .or_default()
            .push(ChildItem {
                key: child_key.to_string(),
                value,
            });
    }
    Ok(children)
}

fn remove_children(
    table: &mut Table<'_, ChildKey, &'static [u8]>,
    entity: EntityRef<'_>,
) -> StorageResult<usize> {
    // Collect first, remove after: the range borrows the table
    let mut keys: Vec<(String, String)> = Vec::new();
    for result in table.range((entity.kind, entity.scope, entity.key, "", "")..)? {
        let (key, _value) = result?;
        let (kind, scope, entity_key, collection, child_key) = key.value();
        if kind != entity.kind || scope != entity.scope || entity_key != entity.key {
            break;
        }
        keys.push((collection.to_string(), child_key.to_string()));
    }

    for (collection, child_key) in &keys {
        table.remove((
            entity.kind,
            entity.scope,
            entity.key,
            collection.as_str(),
            child_key.as_str(),
        ))?;
    }
    Ok(keys.len())
}
