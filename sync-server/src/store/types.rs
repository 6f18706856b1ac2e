use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{ChildItem, Record};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one tracked entity: resource kind + scope + natural key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef<'a> {
    pub kind: &'a str,
    pub scope: &'a str,
    pub key: &'a str,
}

impl<'a> EntityRef<'a> {
    pub fn new(kind: &'a str, scope: &'a str, key: &'a str) -> Self {
        Self { kind, scope, key }
    }

    pub(crate) fn table_key(&self) -> (&'a str, &'a str, &'a str) {
        (self.kind, self.scope, self.key)
    }
}

impl fmt::Display for EntityRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.scope, self.key)
    }
}

/// Stored snapshot row (children live in their own table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotRow {
    pub fields: BTreeMap<String, Value>,
    pub collected_at: i64,
    pub first_collected_at: i64,
}

/// Current state of one entity
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub kind: String,
    pub scope: String,
    pub key: String,
    pub fields: BTreeMap<String, Value>,
    pub children: BTreeMap<String, Vec<ChildItem>>,
    /// Most recent pass that observed this entity
    pub collected_at: i64,
    /// Set once when the entity is first observed
    pub first_collected_at: i64,
}

impl Snapshot {
    pub fn entity(&self) -> EntityRef<'_> {
        EntityRef::new(&self.kind, &self.scope, &self.key)
    }

    /// Rebuild the record shape for diffing against a fresh observation
    pub fn to_record(&self) -> Record {
        Record {
            key: self.key.clone(),
            fields: self.fields.clone(),
            children: self.children.clone(),
            collected_at: self.collected_at,
        }
    }
}
