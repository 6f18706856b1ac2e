//! 版本哈希
//!
//! 设计要点（与审计日志哈希链一致）：
//! - 变长字段间用 `\x00` 分隔，防止 `("ab","cd")` 与 `("abc","d")` 碰撞
//! - 定长字段（u64/i64）用 LE 字节序，无需分隔
//! - fields 为 BTreeMap，序列化结果按 key 排序，稳定
//! - valid_to 不参与哈希：区间关闭时写入一次

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::types::HistoryRecord;

pub(crate) const GENESIS: &str = "genesis";

/// Compute the hash of a version from its immutable parts
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_version_hash(
    prev_hash: &str,
    id: u64,
    kind: &str,
    scope: &str,
    resource_id: &str,
    fields: &BTreeMap<String, Value>,
    collected_at: i64,
    first_collected_at: i64,
    valid_from: i64,
) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();

    // 链接前一版本哈希
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\x00");

    hasher.update(id.to_le_bytes());
    hasher.update(collected_at.to_le_bytes());
    hasher.update(first_collected_at.to_le_bytes());
    hasher.update(valid_from.to_le_bytes());

    for part in [kind, scope, resource_id] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x00");
    }

    let fields_json = serde_json::to_string(fields)?;
    hasher.update(fields_json.as_bytes());
    hasher.update(b"\x00");

    Ok(format!("{:x}", hasher.finalize()))
}

/// Recompute the hash a stored version should carry
pub(crate) fn expected_hash(record: &HistoryRecord) -> serde_json::Result<String> {
    compute_version_hash(
        &record.prev_hash,
        record.id,
        &record.kind,
        &record.scope,
        &record.resource_id,
        &record.fields,
        record.collected_at,
        record.first_collected_at,
        record.valid_from,
    )
}
