//! SyncEngine - one pass for one resource kind within one scope
//!
//! ```text
//! run(scope)
//!   ├─ connect ─► fetch page ─► convert ─► ... (rate-limited, heartbeat per page)
//!   ├─ disconnect (every exit path)
//!   └─ one WriteTransaction for the whole batch
//!        ├─ per record: load snapshot → diff → touch | upsert + open/supersede
//!        ├─ sync_state = collected_at
//!        └─ commit (any error: abort, nothing visible)
//!
//! reconcile(scope, cutoff)    (separate, best-effort)
//!   └─ per stale entity: own transaction → close interval → delete snapshot
//! ```

use serde::Serialize;
use shared::util::{Clock, SystemClock};
use shared::{Record, ResourceAdapter, Scope};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::diff::{diff, normalize};
use super::error::{ReconcileError, SyncError};
use crate::ledger::HistoryLedger;
use crate::orchestrator::Heartbeat;
use crate::rate_limit::RateLimiter;
use crate::store::{EntityRef, InventoryStore, Snapshot, StorageError, StorageResult};

/// Result of a committed pass
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub kind: String,
    pub scope: Scope,
    /// Records processed
    pub count: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub collected_at: i64,
    pub duration_ms: u64,
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub kind: String,
    pub scope: Scope,
    pub cutoff: i64,
    /// Entities whose interval was closed and snapshot deleted
    pub closed: usize,
    /// Entities left in place because their transaction failed
    pub failed: usize,
}

#[derive(Debug, Default)]
struct BatchCounts {
    created: usize,
    updated: usize,
    unchanged: usize,
}

pub struct SyncEngine<A: ResourceAdapter> {
    adapter: A,
    store: InventoryStore,
    ledger: HistoryLedger,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl<A: ResourceAdapter> SyncEngine<A> {
    pub fn new(adapter: A, store: InventoryStore, limiter: RateLimiter) -> Self {
        Self {
            adapter,
            ledger: HistoryLedger::new(store.clone()),
            store,
            limiter,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn kind(&self) -> &str {
        self.adapter.kind()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn store(&self) -> &InventoryStore {
        &self.store
    }

    pub fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    /// Fetch, diff and commit one pass
    ///
    /// Cancellation is honored between pages and before the transaction
    /// opens; once the transaction is open the pass runs to commit or abort
    /// without suspending.
    pub async fn run(
        &self,
        scope: &Scope,
        heartbeat: &Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let kind = self.adapter.kind();
        let collected_at = self.next_collected_at(scope)?;

        let records = self.collect(scope, collected_at, heartbeat, cancel).await?;

        if cancel.is_cancelled() {
            tracing::info!(kind, scope = %scope, fetched = records.len(), "Pass cancelled before commit");
            return Err(SyncError::Cancelled);
        }

        let txn = self.store.begin_write()?;
        let counts = match self.apply_batch(&txn, scope, collected_at, &records) {
            Ok(counts) => counts,
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::warn!(kind, scope = %scope, error = %abort_err, "Abort failed (transaction dropped)");
                }
                if e.is_integrity_fault() {
                    crate::integrity_log!(
                        "batch_aborted",
                        kind = kind,
                        scope = scope.as_str(),
                        error = e.to_string()
                    );
                }
                return Err(e.into());
            }
        };
        txn.commit()?;

        let report = SyncReport {
            kind: kind.to_string(),
            scope: scope.clone(),
            count: records.len(),
            created: counts.created,
            updated: counts.updated,
            unchanged: counts.unchanged,
            collected_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            kind,
            scope = %scope,
            count = report.count,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            collected_at,
            duration_ms = report.duration_ms,
            "Sync pass committed"
        );
        Ok(report)
    }

    /// Close and delete every entity not observed by the pass at `cutoff`
    ///
    /// `cutoff` must be the `collected_at` of the last successful pass.
    /// Each entity is retired in its own transaction; failures are counted
    /// and logged, never propagated.
    pub fn reconcile(&self, scope: &Scope, cutoff: i64) -> Result<ReconcileReport, ReconcileError> {
        let kind = self.adapter.kind();
        let last_success = self.store.last_success(kind, scope.as_str())?;
        if last_success != Some(cutoff) {
            return Err(ReconcileError::StaleCutoff {
                kind: kind.to_string(),
                scope: scope.to_string(),
                cutoff,
                last_success,
            });
        }

        let mut report = ReconcileReport {
            kind: kind.to_string(),
            scope: scope.clone(),
            cutoff,
            closed: 0,
            failed: 0,
        };

        for key in self.store.stale_keys(kind, scope.as_str(), cutoff)? {
            let entity = EntityRef::new(kind, scope.as_str(), &key);
            match self.retire(entity, cutoff) {
                Ok(true) => report.closed += 1,
                Ok(false) => {}
                Err(e) if e.is_integrity_fault() => {
                    report.failed += 1;
                    crate::integrity_log!(
                        "reconcile_failed",
                        entity = entity.to_string(),
                        error = e.to_string()
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(entity = %entity, error = %e, "Failed to retire stale entity");
                }
            }
        }

        if report.closed > 0 || report.failed > 0 {
            tracing::info!(
                kind,
                scope = %scope,
                cutoff,
                closed = report.closed,
                failed = report.failed,
                "Stale entities reconciled"
            );
        }
        Ok(report)
    }

    // ========== Internal ==========

    /// Wall clock, clamped strictly above the last successful pass
    fn next_collected_at(&self, scope: &Scope) -> StorageResult<i64> {
        let now = self.clock.now_millis();
        let last = self.store.last_success(self.adapter.kind(), scope.as_str())?;
        Ok(match last {
            Some(last) if now <= last => {
                tracing::warn!(now, last, "Clock did not advance past last pass, clamping");
                last + 1
            }
            _ => now,
        })
    }

    async fn collect(
        &self,
        scope: &Scope,
        collected_at: i64,
        heartbeat: &Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SyncError> {
        self.limiter.acquire(cancel).await?;
        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            session = self.adapter.connect(scope) => session?,
        };
        heartbeat.beat();

        let result = self
            .fetch_all(&session, scope, collected_at, heartbeat, cancel)
            .await;
        self.adapter.disconnect(session).await;
        result
    }

    async fn fetch_all(
        &self,
        session: &A::Session,
        scope: &Scope,
        collected_at: i64,
        heartbeat: &Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SyncError> {
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.limiter.acquire(cancel).await?;
            // 被放弃的尝试在此处醒来，随后由 collect 释放会话
            let page = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                page = self.adapter.fetch(session, scope, page_token.as_deref()) => page?,
            };
            pages += 1;
            let more = page.has_more();

            for raw in page.items {
                let mut record = self.adapter.convert(raw, scope, collected_at)?;
                record.collected_at = collected_at;
                normalize(&mut record);
                records.push(record);
            }
            heartbeat.beat();
            tracing::debug!(kind = self.adapter.kind(), scope = %scope, pages, fetched = records.len(), "Page fetched");

            if !more {
                break;
            }
            page_token = page.next_token;
        }
        Ok(records)
    }

    fn apply_batch(
        &self,
        txn: &redb::WriteTransaction,
        scope: &Scope,
        collected_at: i64,
        records: &[Record],
    ) -> StorageResult<BatchCounts> {
        let kind = self.adapter.kind();
        let mut counts = BatchCounts::default();

        for record in records {
            let entity = EntityRef::new(kind, scope.as_str(), self.adapter.key(record));
            let existing = self.store.load_snapshot(txn, entity)?;
            let old = existing.as_ref().map(Snapshot::to_record);
            let d = diff(old.as_ref(), record);

            match existing {
                Some(_) if !d.has_any_change() => {
                    self.store.touch_snapshot(txn, entity, collected_at)?;
                    counts.unchanged += 1;
                }
                Some(snapshot) => {
                    self.store
                        .upsert_snapshot(txn, entity, record, snapshot.first_collected_at)?;
                    let outcome = self.ledger.supersede(txn, entity, record, &d, collected_at)?;
                    tracing::debug!(entity = %entity, changed_fields = ?d.changed_fields, ?outcome, "Entity changed");
                    counts.updated += 1;
                }
                None => {
                    let version = self.ledger.open(txn, entity, record, collected_at)?;
                    self.store
                        .upsert_snapshot(txn, entity, record, version.first_collected_at)?;
                    counts.created += 1;
                }
            }
        }

        self.store
            .record_success(txn, kind, scope.as_str(), collected_at)?;
        Ok(counts)
    }

    /// Retire one stale entity inside its own transaction
    fn retire(&self, entity: EntityRef<'_>, cutoff: i64) -> StorageResult<bool> {
        let txn = self.store.begin_write()?;

        // 事务内复查：期间若有新一轮采集看到了它，则保留
        let still_stale = self
            .store
            .load_snapshot(&txn, entity)?
            .is_some_and(|s| s.collected_at < cutoff);
        if !still_stale {
            txn.abort()?;
            return Ok(false);
        }

        self.ledger.close(&txn, entity, cutoff)?;
        self.store.delete_snapshot(&txn, entity)?;
        txn.commit().map_err(StorageError::from)?;
        Ok(true)
    }
}
