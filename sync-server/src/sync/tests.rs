use serde_json::json;
use shared::util::ManualClock;
use shared::{Scope, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::testing::{MockAdapter, item};
use super::*;
use crate::ledger::HistoryLedger;
use crate::orchestrator::Heartbeat;
use crate::rate_limit::RateLimiter;
use crate::store::{EntityRef, InventoryStore, StorageError};

const KIND: &str = "instance";
const SCOPE: &str = "project-1";

struct Harness {
    engine: SyncEngine<MockAdapter>,
    adapter: MockAdapter,
    clock: Arc<ManualClock>,
    scope: Scope,
}

impl Harness {
    fn new() -> Self {
        Self::with_limiter(RateLimiter::unlimited())
    }

    fn with_limiter(limiter: RateLimiter) -> Self {
        let adapter = MockAdapter::new(KIND);
        let clock = Arc::new(ManualClock::new(1_000));
        let store = InventoryStore::open_in_memory().unwrap();
        let engine = SyncEngine::new(adapter.clone(), store, limiter).with_clock(clock.clone());
        Self {
            engine,
            adapter,
            clock,
            scope: Scope::new(SCOPE),
        }
    }

    async fn run(&self) -> Result<SyncReport, SyncError> {
        self.engine
            .run(&self.scope, &Heartbeat::noop(), &CancellationToken::new())
            .await
    }

    /// Run then reconcile against the committed pass
    async fn pass(&self, at: i64) -> SyncReport {
        self.clock.set(at);
        let report = self.run().await.unwrap();
        self.engine.reconcile(&self.scope, report.collected_at).unwrap();
        report
    }

    fn ledger(&self) -> &HistoryLedger {
        self.engine.ledger()
    }

    fn store(&self) -> &InventoryStore {
        self.engine.store()
    }
}

fn entity(key: &str) -> EntityRef<'_> {
    EntityRef::new(KIND, SCOPE, key)
}

#[tokio::test]
async fn test_entity_lifecycle_scenario() {
    let h = Harness::new();

    // t1: X 首次出现
    h.adapter.set_items(vec![json!({"id": "x", "name": "a"})]);
    h.pass(100).await;

    let snapshot = h.store().get_snapshot(entity("x")).unwrap().unwrap();
    assert_eq!(snapshot.fields["name"], json!("a"));
    let versions = h.ledger().versions(entity("x")).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].valid_from, 100);
    assert!(versions[0].is_open());

    // t2: name 变为 b
    h.adapter.set_items(vec![json!({"id": "x", "name": "b"})]);
    h.pass(200).await;

    let snapshot = h.store().get_snapshot(entity("x")).unwrap().unwrap();
    assert_eq!(snapshot.fields["name"], json!("b"));
    let versions = h.ledger().versions(entity("x")).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!((versions[0].valid_from, versions[0].valid_to), (100, Some(200)));
    assert_eq!((versions[1].valid_from, versions[1].valid_to), (200, None));

    // t3: X 消失
    h.adapter.set_items(vec![]);
    h.pass(300).await;

    assert!(h.store().get_snapshot(entity("x")).unwrap().is_none());
    let versions = h.ledger().versions(entity("x")).unwrap();
    assert_eq!((versions[1].valid_from, versions[1].valid_to), (200, Some(300)));
    assert_eq!(h.ledger().open_count(entity("x")).unwrap(), 0);
    assert!(h.ledger().verify(entity("x")).unwrap().chain_intact);
}

#[tokio::test]
async fn test_identical_rerun_only_advances_collected_at() {
    let h = Harness::new();
    h.adapter.set_items(vec![
        item("a", "alpha", &[("env", "prod")]),
        item("b", "beta", &[]),
    ]);

    let first = h.pass(100).await;
    assert_eq!(first.created, 2);

    let second = h.pass(200).await;
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 2);

    for key in ["a", "b"] {
        assert_eq!(h.ledger().versions(entity(key)).unwrap().len(), 1);
        let snapshot = h.store().get_snapshot(entity(key)).unwrap().unwrap();
        assert_eq!(snapshot.collected_at, 200);
        assert_eq!(snapshot.first_collected_at, 100);
    }
    let open = h.ledger().open_version(entity("a")).unwrap().unwrap();
    assert_eq!(h.ledger().children(open.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_at_most_one_open_version_per_entity() {
    let h = Harness::new();
    let sequence: Vec<Vec<serde_json::Value>> = vec![
        vec![item("a", "1", &[]), item("b", "1", &[("k", "v")])],
        vec![item("a", "2", &[]), item("b", "1", &[("k", "w")])],
        vec![item("a", "2", &[])],
        vec![item("a", "3", &[]), item("b", "1", &[])],
        vec![],
        vec![item("b", "2", &[])],
    ];

    for (i, items) in sequence.into_iter().enumerate() {
        h.adapter.set_items(items);
        h.pass(100 * (i as i64 + 1)).await;

        for key in ["a", "b"] {
            let open = h.ledger().open_count(entity(key)).unwrap();
            let live = h.store().get_snapshot(entity(key)).unwrap().is_some();
            assert_eq!(open, usize::from(live), "pass {i}, entity {key}");
        }
        assert!(h.ledger().check_consistency(KIND, SCOPE).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_first_collected_at_survives_changes() {
    let h = Harness::new();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        h.adapter.set_items(vec![item("x", name, &[])]);
        h.pass(1_000 + i as i64 * 10).await;
    }

    let versions = h.ledger().versions(entity("x")).unwrap();
    assert_eq!(versions.len(), 4);
    assert!(versions.iter().all(|v| v.first_collected_at == 1_000));
    assert_eq!(
        h.store().get_snapshot(entity("x")).unwrap().unwrap().first_collected_at,
        1_000
    );

    let report = h.ledger().verify(entity("x")).unwrap();
    assert!(report.chain_intact, "{:?}", report.breaks);
}

#[tokio::test]
async fn test_child_only_change_keeps_parent_interval() {
    let h = Harness::new();
    h.adapter
        .set_items(vec![item("x", "a", &[("env", "prod"), ("team", "infra")])]);
    let first = h.pass(100).await;

    h.adapter
        .set_items(vec![item("x", "a", &[("env", "staging"), ("team", "infra")])]);
    let second = h.pass(200).await;
    assert_eq!(second.updated, 1);

    let versions = h.ledger().versions(entity("x")).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].valid_from, first.collected_at);
    assert!(versions[0].is_open());

    let children = h.ledger().children(versions[0].id).unwrap();
    let closed: Vec<_> = children.iter().filter(|c| !c.is_open()).collect();
    let open: Vec<_> = children.iter().filter(|c| c.is_open()).collect();
    assert_eq!(closed.len(), 2);
    assert!(closed.iter().all(|c| c.valid_to == Some(200)));
    assert_eq!(open.len(), 2);
    assert!(open.iter().all(|c| c.valid_from == 200));

    let snapshot = h.store().get_snapshot(entity("x")).unwrap().unwrap();
    assert_eq!(snapshot.children["labels"].len(), 2);
    assert!(
        snapshot.children["labels"]
            .iter()
            .any(|c| c.key == "env" && c.value == json!("staging"))
    );
}

#[tokio::test]
async fn test_reconcile_retires_only_unseen_entities() {
    let h = Harness::new();
    h.adapter
        .set_items(vec![item("a", "alpha", &[]), item("b", "beta", &[("env", "x")])]);
    h.pass(100).await;

    h.clock.set(200);
    h.adapter.set_items(vec![item("a", "alpha", &[])]);
    let report = h.run().await.unwrap();
    let reconciled = h.engine.reconcile(&h.scope, report.collected_at).unwrap();
    assert_eq!(reconciled.closed, 1);
    assert_eq!(reconciled.failed, 0);

    assert!(h.store().get_snapshot(entity("b")).unwrap().is_none());
    let b = h.ledger().versions(entity("b")).unwrap();
    assert_eq!(b[0].valid_to, Some(200));
    assert!(h.ledger().children(b[0].id).unwrap().iter().all(|c| c.valid_to == Some(200)));

    let a = h.ledger().versions(entity("a")).unwrap();
    assert_eq!(a.len(), 1);
    assert!(a[0].is_open());

    // 重复 reconcile 无副作用
    let again = h.engine.reconcile(&h.scope, report.collected_at).unwrap();
    assert_eq!(again.closed, 0);
}

#[tokio::test]
async fn test_reconcile_rejects_cutoff_other_than_last_success() {
    let h = Harness::new();

    let err = h.engine.reconcile(&h.scope, 100).unwrap_err();
    assert!(matches!(err, ReconcileError::StaleCutoff { last_success: None, .. }));

    h.adapter.set_items(vec![item("a", "alpha", &[])]);
    let report = h.pass(100).await;

    for cutoff in [report.collected_at - 1, report.collected_at + 1] {
        let err = h.engine.reconcile(&h.scope, cutoff).unwrap_err();
        assert!(matches!(err, ReconcileError::StaleCutoff { .. }));
    }
    assert!(h.store().get_snapshot(entity("a")).unwrap().is_some());
}

#[tokio::test]
async fn test_integrity_fault_rolls_back_whole_batch() {
    let h = Harness::new();
    let names = |v: &str| -> Vec<serde_json::Value> {
        (1..=10).map(|i| item(&format!("e{i:02}"), v, &[])).collect()
    };

    h.adapter.set_items(names("old"));
    let first = h.pass(100).await;

    // e05 失去索引：打开版本仍在，但 supersede 找不到它
    h.ledger().drop_open_index(entity("e05")).unwrap();

    h.clock.set(200);
    h.adapter.set_items(names("new"));
    let err = h.run().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Persistence(StorageError::LedgerCorruption { .. })
    ));
    assert_eq!(err.class(), ErrorClass::Integrity);

    for i in 1..=4 {
        let key = format!("e{i:02}");
        let snapshot = h.store().get_snapshot(entity(&key)).unwrap().unwrap();
        assert_eq!(snapshot.fields["name"], json!("old"), "{key}");
        assert_eq!(snapshot.collected_at, 100);
        assert_eq!(h.ledger().versions(entity(&key)).unwrap().len(), 1);
    }
    assert_eq!(
        h.store().last_success(KIND, SCOPE).unwrap(),
        Some(first.collected_at)
    );
}

#[tokio::test]
async fn test_conversion_error_fails_pass_without_writes() {
    let h = Harness::new();
    h.adapter
        .set_items(vec![item("a", "alpha", &[]), json!({"name": "no id"})]);

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Conversion(_)));
    assert!(err.is_retryable());

    assert!(h.store().get_snapshot(entity("a")).unwrap().is_none());
    assert_eq!(h.store().last_success(KIND, SCOPE).unwrap(), None);
}

#[tokio::test]
async fn test_transport_error_releases_session() {
    let h = Harness::new();
    h.adapter.set_items(vec![item("a", "alpha", &[])]);
    h.adapter
        .fail_next_fetch(TransportError::Quota("read requests".into()));

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(TransportError::Quota(_))));
    h.adapter.with_state(|s| {
        assert_eq!(s.connects, 1);
        assert_eq!(s.disconnects, 1);
    });

    // 下一次尝试成功
    let report = h.run().await.unwrap();
    assert_eq!(report.created, 1);
    h.adapter.with_state(|s| assert_eq!(s.disconnects, 2));
}

#[tokio::test]
async fn test_pagination_beats_per_page() {
    let h = Harness::new();
    h.adapter.set_page_size(2);
    h.adapter
        .set_items((0..5).map(|i| item(&format!("k{i}"), "n", &[])).collect());

    let heartbeat = Heartbeat::noop();
    let report = h
        .engine
        .run(&h.scope, &heartbeat, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.count, 5);
    h.adapter.with_state(|s| assert_eq!(s.fetches, 3));
    // connect + 3 pages
    assert_eq!(heartbeat.count(), 4);
}

#[tokio::test]
async fn test_cancel_between_pages_commits_nothing() {
    let h = Harness::new();
    h.adapter.set_page_size(1);
    h.adapter
        .set_items(vec![item("a", "1", &[]), item("b", "1", &[]), item("c", "1", &[])]);

    let cancel = CancellationToken::new();
    h.adapter.cancel_on_fetch(1, cancel.clone());

    let err = h
        .engine
        .run(&h.scope, &Heartbeat::noop(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert!(!err.is_retryable());

    h.adapter.with_state(|s| {
        assert_eq!(s.fetches, 1);
        assert_eq!(s.disconnects, 1);
    });
    assert!(h.store().list_snapshots(KIND, SCOPE).unwrap().is_empty());
    assert_eq!(h.store().last_success(KIND, SCOPE).unwrap(), None);
}

#[tokio::test]
async fn test_cancel_after_last_page_skips_transaction() {
    let h = Harness::new();
    h.adapter.set_items(vec![item("a", "1", &[])]);

    let cancel = CancellationToken::new();
    h.adapter.cancel_on_fetch(1, cancel.clone());

    let err = h.engine.run(&h.scope, &Heartbeat::noop(), &cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert!(h.store().get_snapshot(entity("a")).unwrap().is_none());
}

#[tokio::test]
async fn test_collected_at_strictly_increases() {
    let h = Harness::new();
    h.adapter.set_items(vec![item("a", "1", &[])]);
    let first = h.pass(500).await;

    // 时钟回拨
    h.clock.set(400);
    h.adapter.set_items(vec![item("a", "2", &[])]);
    let second = h.run().await.unwrap();
    assert_eq!(second.collected_at, first.collected_at + 1);

    let versions = h.ledger().versions(entity("a")).unwrap();
    assert_eq!(versions[0].valid_to, Some(501));
    assert_eq!(versions[1].valid_from, 501);
}

#[tokio::test]
async fn test_duplicate_keys_in_one_fetch_apply_in_order() {
    let h = Harness::new();
    h.adapter
        .set_items(vec![item("a", "first", &[]), item("a", "second", &[])]);

    let report = h.pass(100).await;
    assert_eq!(report.created, 1);
    assert_eq!(report.updated, 1);

    let versions = h.ledger().versions(entity("a")).unwrap();
    assert_eq!(versions.len(), 2);
    // 同一时刻关闭并打开：零长度区间
    assert_eq!(versions[0].valid_from, versions[0].valid_to.unwrap());
    assert_eq!(versions[1].fields["name"], json!("second"));
    assert!(h.ledger().check_consistency(KIND, SCOPE).unwrap().is_empty());
}

#[tokio::test]
async fn test_scopes_are_isolated() {
    let h = Harness::new();
    h.adapter.set_items(vec![item("a", "1", &[])]);
    h.pass(100).await;

    let other = Scope::new("project-2");
    h.clock.set(200);
    h.adapter.set_items(vec![]);
    let report = h
        .engine
        .run(&other, &Heartbeat::noop(), &CancellationToken::new())
        .await
        .unwrap();
    h.engine.reconcile(&other, report.collected_at).unwrap();

    assert!(h.store().get_snapshot(entity("a")).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_releases_session_during_hung_fetch() {
    let h = Harness::new();
    h.adapter.set_items(vec![item("a", "1", &[])]);
    h.adapter.hang_fetch();

    let cancel = CancellationToken::new();
    let heartbeat = Heartbeat::noop();
    let pass = h.engine.run(&h.scope, &heartbeat, &cancel);
    let canceller = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(pass, canceller);

    assert!(matches!(result.unwrap_err(), SyncError::Cancelled));
    h.adapter.with_state(|s| {
        assert_eq!(s.connects, 1);
        assert_eq!(s.disconnects, 1);
    });
    assert!(h.store().get_snapshot(entity("a")).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_every_adapter_call_takes_a_token() {
    let h = Harness::with_limiter(RateLimiter::new(1, 1.0));
    h.adapter.set_items((0..5).map(|i| item(&format!("i{i}"), "n", &[])).collect());
    h.adapter.set_page_size(2);

    let started = Instant::now();
    let report = h.run().await.unwrap();

    assert_eq!(report.count, 5);
    h.adapter.with_state(|s| assert_eq!(s.fetches, 3));
    // connect 用掉初始令牌，三次 fetch 各等 1s
    assert!(started.elapsed() >= Duration::from_secs(3), "took {:?}", started.elapsed());
}

#[tokio::test(start_paused = true)]
async fn test_engines_sharing_a_limiter_drain_one_bucket() {
    let limiter = RateLimiter::new(2, 1.0);
    let first = Harness::with_limiter(limiter.clone());
    let second = Harness::with_limiter(limiter.clone());
    first.adapter.set_items(vec![item("a", "1", &[])]);
    second.adapter.set_items(vec![item("b", "1", &[])]);

    first.run().await.unwrap();
    assert_eq!(limiter.available().await, 0);

    let started = Instant::now();
    second.run().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2), "took {:?}", started.elapsed());
}
