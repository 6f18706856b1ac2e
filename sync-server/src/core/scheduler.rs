//! Periodic sync scheduler
//!
//! Every interval: discover `<SOURCE_DIR>/<scope>/<kind>.json`, run each
//! scope through [`Orchestrator::run_scope`] (scopes concurrently), then check
//! the snapshot/ledger invariants of every synced kind.

use futures::future::join_all;
use serde::Serialize;
use shared::Scope;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Config;
use crate::adapters::{JsonFileAdapter, discover_sources};
use crate::ledger::HistoryLedger;
use crate::orchestrator::{Orchestrator, ScopeError, ScopeReport, SyncJob};
use crate::rate_limit::RateLimiter;
use crate::store::InventoryStore;
use crate::sync::SyncEngine;

/// Outcome of one scheduler round
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundSummary {
    pub scopes: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items processed by successful kinds
    pub items: usize,
    /// Snapshot/ledger mismatches found after the round
    pub inconsistencies: usize,
}

pub struct SyncScheduler {
    source_dir: PathBuf,
    key_field: String,
    child_fields: Vec<String>,
    page_size: usize,
    interval: Duration,
    store: InventoryStore,
    ledger: HistoryLedger,
    limiter: RateLimiter,
    orchestrator: Orchestrator,
    /// kind -> engine, created on first sight
    engines: BTreeMap<String, Arc<dyn SyncJob>>,
}

impl SyncScheduler {
    pub fn new(config: &Config, store: InventoryStore, shutdown: CancellationToken) -> Self {
        Self {
            source_dir: config.source_dir.clone(),
            key_field: config.key_field.clone(),
            child_fields: config.child_fields.clone(),
            page_size: config.page_size,
            interval: config.sync_interval,
            ledger: HistoryLedger::new(store.clone()),
            store,
            // 同一数据源共享一个限流器
            limiter: RateLimiter::new(config.rate_limit_burst, config.rate_limit_per_sec),
            orchestrator: Orchestrator::new(config.orchestrator(), shutdown),
            engines: BTreeMap::new(),
        }
    }

    fn job(&mut self, kind: &str) -> Arc<dyn SyncJob> {
        if let Some(job) = self.engines.get(kind) {
            return job.clone();
        }
        let adapter = JsonFileAdapter::new(&self.source_dir, kind)
            .with_key_field(&self.key_field)
            .with_child_fields(self.child_fields.clone())
            .with_page_size(self.page_size);
        let job: Arc<dyn SyncJob> = Arc::new(SyncEngine::new(
            adapter,
            self.store.clone(),
            self.limiter.clone(),
        ));
        self.engines.insert(kind.to_string(), job.clone());
        job
    }

    /// Run every discovered scope once
    pub async fn run_once(&mut self) -> RoundSummary {
        let sources = match discover_sources(&self.source_dir) {
            Ok(sources) => sources,
            Err(e) => {
                tracing::warn!(dir = %self.source_dir.display(), error = %e, "Cannot read source directory");
                return RoundSummary::default();
            }
        };

        let plan: Vec<(Scope, Vec<Arc<dyn SyncJob>>)> = sources
            .into_iter()
            .map(|(scope, kinds)| {
                let jobs = kinds.iter().map(|kind| self.job(kind)).collect();
                (scope, jobs)
            })
            .collect();

        let orchestrator = &self.orchestrator;
        let results: Vec<Result<ScopeReport, ScopeError>> = join_all(
            plan.iter()
                .map(|(scope, jobs)| orchestrator.run_scope(scope, jobs)),
        )
        .await;

        let mut summary = RoundSummary {
            scopes: plan.len(),
            ..RoundSummary::default()
        };
        for result in &results {
            match result {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.items += report.item_count();
                }
                Err(ScopeError::ChildrenFailed { report, .. } | ScopeError::Cancelled { report, .. }) => {
                    summary.failed += 1;
                    summary.items += report.item_count();
                }
                Err(ScopeError::InvalidTransition(_)) => summary.failed += 1,
            }
        }

        for (scope, jobs) in &plan {
            for job in jobs {
                summary.inconsistencies += self.check(job.kind(), scope);
            }
        }

        tracing::info!(
            scopes = summary.scopes,
            succeeded = summary.succeeded,
            failed = summary.failed,
            items = summary.items,
            inconsistencies = summary.inconsistencies,
            "Sync round finished"
        );
        summary
    }

    fn check(&self, kind: &str, scope: &Scope) -> usize {
        match self.ledger.check_consistency(kind, scope.as_str()) {
            Ok(issues) => {
                for issue in &issues {
                    crate::integrity_log!(
                        "inconsistency",
                        kind = kind,
                        scope = scope.as_str(),
                        issue = format!("{issue:?}")
                    );
                }
                issues.len()
            }
            Err(e) => {
                tracing::warn!(kind, scope = %scope, error = %e, "Consistency check failed");
                0
            }
        }
    }

    /// Run rounds every interval until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            dir = %self.source_dir.display(),
            interval_secs = self.interval.as_secs(),
            "Sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Sync scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityRef;
    use serde_json::json;

    fn config(source_dir: &std::path::Path) -> Config {
        let mut config = Config::from_env();
        config.source_dir = source_dir.to_path_buf();
        config.key_field = "id".into();
        config.child_fields = vec!["labels".into()];
        config.retry.max_attempts = 1;
        config.scope_retry_max_attempts = 1;
        config
    }

    #[tokio::test]
    async fn test_round_syncs_every_scope_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        for (scope, kind) in [("p1", "bucket"), ("p1", "instance"), ("p2", "bucket")] {
            let path = dir.path().join(scope);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(
                path.join(format!("{kind}.json")),
                json!([{"id": "a", "labels": {"env": "prod"}}, {"id": "b"}]).to_string(),
            )
            .unwrap();
        }

        let store = InventoryStore::open_in_memory().unwrap();
        let mut scheduler =
            SyncScheduler::new(&config(dir.path()), store.clone(), CancellationToken::new());

        let summary = scheduler.run_once().await;
        assert_eq!(summary.scopes, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.items, 6);
        assert_eq!(summary.inconsistencies, 0);

        let snapshot = store
            .get_snapshot(EntityRef::new("instance", "p1", "a"))
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.children["labels"].len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_export_fails_only_its_scope() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("good")).unwrap();
        std::fs::create_dir_all(dir.path().join("bad")).unwrap();
        std::fs::write(dir.path().join("good/bucket.json"), r#"[{"id": "a"}]"#).unwrap();
        std::fs::write(dir.path().join("bad/bucket.json"), "{not json").unwrap();

        let store = InventoryStore::open_in_memory().unwrap();
        let mut scheduler =
            SyncScheduler::new(&config(dir.path()), store.clone(), CancellationToken::new());

        let summary = scheduler.run_once().await;
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert!(
            store
                .get_snapshot(EntityRef::new("bucket", "good", "a"))
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_missing_source_dir_is_an_empty_round() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::open_in_memory().unwrap();
        let mut scheduler = SyncScheduler::new(
            &config(&dir.path().join("absent")),
            store,
            CancellationToken::new(),
        );

        assert_eq!(scheduler.run_once().await.scopes, 0);
    }
}
