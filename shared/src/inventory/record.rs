//! Generic record shape produced by resource adapters
//!
//! Every resource kind (VM instance, bucket, agent-reported application, ...)
//! is converted into the same shape: a flat map of domain fields plus zero or
//! more keyed child collections (labels, policy bindings, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Addressing context of one sync pass (provider account / project id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One element of an unordered, keyed child collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildItem {
    pub key: String,
    pub value: Value,
}

impl ChildItem {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Converted resource, ready to be diffed and persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Natural key (e.g. provider resource name), unique within kind + scope
    pub key: String,
    /// Domain fields. BTreeMap keeps the serialized form canonical.
    pub fields: BTreeMap<String, Value>,
    /// collection name -> items
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<ChildItem>>,
    /// Timestamp of the pass that produced this record (Unix millis)
    pub collected_at: i64,
}

impl Record {
    pub fn new(key: impl Into<String>, collected_at: i64) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            children: BTreeMap::new(),
            collected_at,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_child(
        mut self,
        collection: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.children
            .entry(collection.into())
            .or_default()
            .push(ChildItem::new(key, value));
        self
    }

    /// Items of a collection; a missing collection reads as empty
    pub fn child_items(&self, collection: &str) -> &[ChildItem] {
        self.children
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
