//! 变更检测：比较已存储记录与新采集记录
//!
//! 与审计 diff 不同，这里只需要分类（新建 / 未变 / 已变），不生成 patch：
//! - 核心字段逐一比较（结构化 payload 按字节语义比较，不做浮点容差）
//! - 子集合（labels 等）无序、按 key 比较，结果只是一个布尔值

use serde_json::Value;
use shared::{ChildItem, Record};
use std::collections::{BTreeSet, HashMap};

/// Change state of one child collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDiff {
    pub collection: String,
    pub changed: bool,
}

/// Classification of a freshly converted record against the stored one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// No stored record existed
    pub is_new: bool,
    /// At least one core field differs
    pub is_changed: bool,
    /// Names of the differing core fields (for logging)
    pub changed_fields: Vec<String>,
    pub child_diffs: Vec<ChildDiff>,
}

impl Diff {
    fn new_entity() -> Self {
        Self {
            is_new: true,
            ..Self::default()
        }
    }

    pub fn children_changed(&self) -> bool {
        self.child_diffs.iter().any(|c| c.changed)
    }

    pub fn has_any_change(&self) -> bool {
        self.is_new || self.is_changed || self.children_changed()
    }

    /// Names of the child collections that changed
    pub fn changed_collections(&self) -> impl Iterator<Item = &str> {
        self.child_diffs
            .iter()
            .filter(|c| c.changed)
            .map(|c| c.collection.as_str())
    }
}

/// Compare `old` (stored) with `new` (just converted)
pub fn diff(old: Option<&Record>, new: &Record) -> Diff {
    let Some(old) = old else {
        return Diff::new_entity();
    };

    let mut names: BTreeSet<&String> = old.fields.keys().collect();
    names.extend(new.fields.keys());

    let changed_fields: Vec<String> = names
        .into_iter()
        .filter(|name| old.fields.get(*name) != new.fields.get(*name))
        .cloned()
        .collect();

    let mut collections: BTreeSet<&String> = old.children.keys().collect();
    collections.extend(new.children.keys());

    let child_diffs = collections
        .into_iter()
        .map(|collection| ChildDiff {
            collection: collection.clone(),
            changed: children_differ(old.child_items(collection), new.child_items(collection)),
        })
        .collect();

    Diff {
        is_new: false,
        is_changed: !changed_fields.is_empty(),
        changed_fields,
        child_diffs,
    }
}

/// Unordered keyed-set comparison
fn children_differ(old: &[ChildItem], new: &[ChildItem]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    let by_key: HashMap<&str, &Value> = old
        .iter()
        .map(|item| (item.key.as_str(), &item.value))
        .collect();
    new.iter()
        .any(|item| by_key.get(item.key.as_str()) != Some(&&item.value))
}

/// Collapse duplicate child keys inside each collection (last wins) and drop
/// empty collections, so that a record diffs the same way it will be stored.
pub fn normalize(record: &mut Record) {
    for items in record.children.values_mut() {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut deduped: Vec<ChildItem> = Vec::with_capacity(items.len());
        for item in items.drain(..) {
            match seen.get(&item.key) {
                Some(&idx) => deduped[idx] = item,
                None => {
                    seen.insert(item.key.clone(), deduped.len());
                    deduped.push(item);
                }
            }
        }
        *items = deduped;
    }
    record.children.retain(|_, items| !items.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Record {
        Record::new("vm-1", 1)
            .with_field("name", "vm-1")
            .with_field("machine_type", "e2-small")
            .with_field("metadata", json!({"startup": "echo hi", "items": [1, 2, 3]}))
            .with_child("labels", "env", "prod")
            .with_child("labels", "team", "infra")
    }

    #[test]
    fn test_missing_old_is_new() {
        let d = diff(None, &base());
        assert!(d.is_new);
        assert!(!d.is_changed);
        assert!(d.child_diffs.is_empty());
        assert!(d.has_any_change());
    }

    #[test]
    fn test_identical_records_are_unchanged() {
        let old = base();
        let mut new = base();
        new.collected_at = 99; // collected_at 不参与比较

        let d = diff(Some(&old), &new);
        assert!(!d.is_new);
        assert!(!d.is_changed);
        assert!(!d.children_changed());
        assert!(!d.has_any_change());
    }

    #[test]
    fn test_field_change_is_detected() {
        let old = base();
        let new = base().with_field("machine_type", "e2-medium");

        let d = diff(Some(&old), &new);
        assert!(d.is_changed);
        assert_eq!(d.changed_fields, vec!["machine_type"]);
        assert!(!d.children_changed());
    }

    #[test]
    fn test_added_and_removed_fields_are_changes() {
        let old = base();
        let mut new = base().with_field("zone", "b");
        new.fields.remove("name");

        let d = diff(Some(&old), &new);
        assert_eq!(d.changed_fields, vec!["name", "zone"]);
    }

    #[test]
    fn test_nested_payload_compared_exactly() {
        let old = base();
        let new = base().with_field("metadata", json!({"startup": "echo hi", "items": [1, 2, 4]}));

        let d = diff(Some(&old), &new);
        assert_eq!(d.changed_fields, vec!["metadata"]);

        // 整数与浮点表示不同，视为变更
        let old = base().with_field("cpu", json!(2));
        let new = base().with_field("cpu", json!(2.0));
        assert!(diff(Some(&old), &new).is_changed);
    }

    #[test]
    fn test_child_order_is_irrelevant() {
        let old = base();
        let new = Record::new("vm-1", 1)
            .with_field("name", "vm-1")
            .with_field("machine_type", "e2-small")
            .with_field("metadata", json!({"startup": "echo hi", "items": [1, 2, 3]}))
            .with_child("labels", "team", "infra")
            .with_child("labels", "env", "prod");

        assert!(!diff(Some(&old), &new).has_any_change());
    }

    #[test]
    fn test_child_value_change_only() {
        let old = base();
        let mut new = base();
        new.children.get_mut("labels").unwrap()[0].value = json!("staging");

        let d = diff(Some(&old), &new);
        assert!(!d.is_changed);
        assert!(d.children_changed());
        assert_eq!(d.changed_collections().collect::<Vec<_>>(), vec!["labels"]);
    }

    #[test]
    fn test_child_size_and_key_mismatch() {
        let old = base();
        let new = base().with_child("labels", "owner", "alice");
        assert!(diff(Some(&old), &new).children_changed());

        let mut renamed = base();
        renamed.children.get_mut("labels").unwrap()[1].key = "squad".to_string();
        assert!(diff(Some(&old), &renamed).children_changed());
    }

    #[test]
    fn test_collection_missing_on_one_side() {
        let old = base();
        let new = base().with_child("bindings", "roles/viewer", json!(["user:a"]));

        let d = diff(Some(&old), &new);
        assert_eq!(d.changed_collections().collect::<Vec<_>>(), vec!["bindings"]);
        assert!(d.child_diffs.iter().any(|c| c.collection == "labels" && !c.changed));
    }

    #[test]
    fn test_normalize_dedupes_and_drops_empty() {
        let mut record = Record::new("vm-1", 1)
            .with_child("labels", "env", "prod")
            .with_child("labels", "env", "staging")
            .with_child("labels", "team", "infra");
        record.children.insert("bindings".to_string(), Vec::new());

        normalize(&mut record);

        let labels = record.child_items("labels");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0], ChildItem::new("env", "staging"));
        assert!(!record.children.contains_key("bindings"));
    }
}
