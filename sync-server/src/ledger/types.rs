//! 历史版本类型定义
//!
//! 每个版本覆盖半开区间 `[valid_from, valid_to)`，`valid_to = None` 表示当前版本。
//! 版本关闭后不再修改。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One version of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Surrogate id (global, monotonically increasing)
    pub id: u64,
    pub kind: String,
    pub scope: String,
    /// Entity key
    pub resource_id: String,
    pub fields: BTreeMap<String, Value>,
    /// collected_at of the pass that opened this version
    pub collected_at: i64,
    /// Copied forward unchanged across versions of the same entity
    pub first_collected_at: i64,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
    /// curr_hash of the superseded version, `genesis` for the first one
    pub prev_hash: String,
    /// SHA256 over the immutable parts of this version
    pub curr_hash: String,
}

impl HistoryRecord {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// One version of a child collection element, owned by a [`HistoryRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildHistoryRecord {
    pub id: u64,
    pub parent_id: u64,
    pub collection: String,
    pub child_key: String,
    pub value: Value,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
}

impl ChildHistoryRecord {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// Outcome of [`HistoryLedger::supersede`](super::HistoryLedger::supersede)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supersession {
    /// Core fields changed: old version closed, new one opened
    Replaced { closed: u64, opened: u64 },
    /// Only child collections changed: parent untouched
    ChildrenOnly { parent: u64, collections: usize },
    /// Nothing to record
    Unchanged,
}

/// 链验证结果
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    /// 验证的版本总数
    pub total_versions: usize,
    /// 当前打开的版本数（0 或 1）
    pub open_versions: usize,
    /// 链是否完整
    pub chain_intact: bool,
    /// 断裂点列表
    pub breaks: Vec<ChainBreak>,
}

/// 链断裂点
#[derive(Debug, Clone, Serialize)]
pub struct ChainBreak {
    /// 断裂处的版本 id
    pub version_id: u64,
    pub reason: String,
}
