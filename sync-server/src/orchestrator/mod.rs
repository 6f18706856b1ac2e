//! Orchestrator - retrying execution of sync passes
//!
//! # Task
//!
//! One task = one resource kind in one scope. Each attempt runs a full pass
//! from scratch under a deadline and a heartbeat watchdog; a committed pass
//! is followed by a best-effort reconcile whose failure never fails the task.
//!
//! # Scope
//!
//! A scope task runs every kind's task concurrently. When some children fail
//! the scope task is retried with its own policy, re-running only children
//! that have not succeeded and did not fail terminally.

mod heartbeat;
mod policy;
mod task;


pub use heartbeat::{Heartbeat, HeartbeatMonitor};
pub use policy::RetryPolicy;
pub use task::{TaskState, TaskTracker, TransitionError};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use shared::{ResourceAdapter, Scope};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::sync::{ErrorClass, ReconcileError, ReconcileReport, SyncEngine, SyncError, SyncReport};

// ========== Job ==========

/// Object-safe view of a [`SyncEngine`], erasing its adapter type
#[async_trait]
pub trait SyncJob: Send + Sync {
    fn kind(&self) -> &str;

    async fn run(
        &self,
        scope: &Scope,
        heartbeat: &Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError>;

    async fn reconcile(&self, scope: &Scope, cutoff: i64) -> Result<ReconcileReport, ReconcileError>;
}

#[async_trait]
impl<A: ResourceAdapter + 'static> SyncJob for SyncEngine<A> {
    fn kind(&self) -> &str {
        SyncEngine::kind(self)
    }

    async fn run(
        &self,
        scope: &Scope,
        heartbeat: &Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        SyncEngine::run(self, scope, heartbeat, cancel).await
    }

    async fn reconcile(&self, scope: &Scope, cutoff: i64) -> Result<ReconcileReport, ReconcileError> {
        SyncEngine::reconcile(self, scope, cutoff)
    }
}

// ========== Errors ==========

/// Why a single attempt failed
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("attempt exceeded {0:?}")]
    TimedOut(Duration),

    #[error("no heartbeat for {0:?}")]
    HeartbeatLost(Duration),

    #[error("attempt cancelled by shutdown")]
    Cancelled,
}

impl AttemptError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Sync(e) => e.class(),
            AttemptError::TimedOut(_) | AttemptError::HeartbeatLost(_) => ErrorClass::Timeout,
            AttemptError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{task} failed after {attempts} attempts: {source}")]
    Exhausted {
        task: String,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("{task} failed terminally on attempt {attempts}: {source}")]
    Terminal {
        task: String,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("{task} cancelled after {attempts} attempts")]
    Cancelled { task: String, attempts: u32 },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl TaskError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::Exhausted { source, .. } | TaskError::Terminal { source, .. } => {
                source.class()
            }
            TaskError::Cancelled { .. } => ErrorClass::Cancelled,
            TaskError::InvalidTransition(_) => ErrorClass::Integrity,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            TaskError::Exhausted { attempts, .. }
            | TaskError::Terminal { attempts, .. }
            | TaskError::Cancelled { attempts, .. } => *attempts,
            TaskError::InvalidTransition(_) => 0,
        }
    }

    /// Whether a parent task may run this child again
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Exhausted { .. }) && self.class().is_retryable()
    }
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("scope {scope}: {failed} of {total} resource kinds failed")]
    ChildrenFailed {
        scope: Scope,
        failed: usize,
        total: usize,
        report: ScopeReport,
    },

    #[error("scope {scope} cancelled")]
    Cancelled { scope: Scope, report: ScopeReport },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

// ========== Reports ==========

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub attempts: u32,
    pub sync: SyncReport,
    /// `None` when reconciliation failed (logged)
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildOutcome {
    Succeeded {
        report: TaskReport,
    },
    Failed {
        class: ErrorClass,
        attempts: u32,
        retryable: bool,
        error: String,
    },
}

impl ChildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChildOutcome::Succeeded { .. })
    }

    /// Worth running again in the next scope attempt
    fn needs_rerun(&self) -> bool {
        matches!(self, ChildOutcome::Failed { retryable: true, .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeReport {
    pub scope: Scope,
    /// Scope-level attempts
    pub attempts: u32,
    /// Outcome per resource kind
    pub children: BTreeMap<String, ChildOutcome>,
}

impl ScopeReport {
    pub fn failed(&self) -> usize {
        self.children.values().filter(|c| !c.is_success()).count()
    }

    /// Items processed by the successful children
    pub fn item_count(&self) -> usize {
        self.children
            .values()
            .map(|c| match c {
                ChildOutcome::Succeeded { report } => report.sync.count,
                ChildOutcome::Failed { .. } => 0,
            })
            .sum()
    }
}

// ========== Orchestrator ==========

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Per-kind task policy
    pub retry: RetryPolicy,
    /// Scope (parent) task policy
    pub scope_retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            scope_retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            attempt_timeout: Duration::from_secs(600),
            heartbeat_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one resource kind in one scope to completion or exhaustion
    pub async fn run_task(&self, job: &dyn SyncJob, scope: &Scope) -> Result<TaskReport, TaskError> {
        let task = format!("{}/{}", job.kind(), scope);
        let policy = &self.config.retry;
        let mut tracker = TaskTracker::new(&task);

        loop {
            if self.shutdown.is_cancelled() {
                return Err(TaskError::Cancelled {
                    task,
                    attempts: tracker.attempts(),
                });
            }

            let attempt = tracker.begin_attempt()?;
            tracing::debug!(task = %task, attempt, "Sync attempt started");

            let error = match self.attempt(job, scope).await {
                Ok(sync) => {
                    tracker.succeed()?;
                    let reconcile = match job.reconcile(scope, sync.collected_at).await {
                        Ok(report) => Some(report),
                        Err(e) => {
                            tracing::warn!(task = %task, error = %e, "Reconcile failed, stale entities kept until next pass");
                            None
                        }
                    };
                    return Ok(TaskReport {
                        task,
                        attempts: attempt,
                        sync,
                        reconcile,
                    });
                }
                Err(e) => e,
            };

            let class = error.class();
            tracker.fail(class.is_retryable())?;

            if class == ErrorClass::Cancelled {
                tracing::info!(task = %task, attempt, "Sync task cancelled");
                return Err(TaskError::Cancelled {
                    task,
                    attempts: attempt,
                });
            }
            if !class.is_retryable() {
                tracing::error!(task = %task, attempt, ?class, error = %error, "Sync task failed terminally");
                return Err(TaskError::Terminal {
                    task,
                    attempts: attempt,
                    source: error,
                });
            }
            if !policy.allows_retry_after(attempt) {
                tracing::error!(task = %task, attempt, ?class, error = %error, "Sync task exhausted retries");
                return Err(TaskError::Exhausted {
                    task,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                task = %task,
                attempt,
                ?class,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Sync attempt failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(TaskError::Cancelled { task, attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run every kind for a scope, retrying the scope as a whole
    pub async fn run_scope(
        &self,
        scope: &Scope,
        jobs: &[Arc<dyn SyncJob>],
    ) -> Result<ScopeReport, ScopeError> {
        let policy = &self.config.scope_retry;
        let mut tracker = TaskTracker::new(format!("scope/{scope}"));
        let mut children: BTreeMap<String, ChildOutcome> = BTreeMap::new();

        loop {
            if self.shutdown.is_cancelled() {
                return Err(ScopeError::Cancelled {
                    scope: scope.clone(),
                    report: ScopeReport {
                        scope: scope.clone(),
                        attempts: tracker.attempts(),
                        children,
                    },
                });
            }
            let attempt = tracker.begin_attempt()?;

            let pending: Vec<&Arc<dyn SyncJob>> = jobs
                .iter()
                .filter(|job| children.get(job.kind()).is_none_or(ChildOutcome::needs_rerun))
                .collect();
            tracing::info!(scope = %scope, attempt, kinds = pending.len(), "Scope attempt started");

            let results = join_all(pending.into_iter().map(|job| async move {
                (job.kind().to_string(), self.run_task(job.as_ref(), scope).await)
            }))
            .await;

            let mut cancelled = false;
            for (kind, result) in results {
                let outcome = match result {
                    Ok(report) => ChildOutcome::Succeeded { report },
                    Err(e) => {
                        cancelled |= e.class() == ErrorClass::Cancelled;
                        ChildOutcome::Failed {
                            class: e.class(),
                            attempts: e.attempts(),
                            retryable: e.is_retryable(),
                            error: e.to_string(),
                        }
                    }
                };
                children.insert(kind, outcome);
            }

            let report = ScopeReport {
                scope: scope.clone(),
                attempts: attempt,
                children: children.clone(),
            };
            let failed = report.failed();
            if failed == 0 {
                tracker.succeed()?;
                tracing::info!(scope = %scope, attempt, items = report.item_count(), "Scope sync succeeded");
                return Ok(report);
            }

            let rerunnable = children.values().any(ChildOutcome::needs_rerun);
            tracker.fail(rerunnable && !cancelled)?;

            if cancelled {
                return Err(ScopeError::Cancelled {
                    scope: scope.clone(),
                    report,
                });
            }
            if !rerunnable || !policy.allows_retry_after(attempt) {
                tracing::error!(scope = %scope, attempt, failed, total = jobs.len(), "Scope sync failed");
                return Err(ScopeError::ChildrenFailed {
                    scope: scope.clone(),
                    failed,
                    total: jobs.len(),
                    report,
                });
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(scope = %scope, attempt, failed, delay_ms = delay.as_millis() as u64, "Scope sync incomplete, retrying failed kinds");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(ScopeError::Cancelled { scope: scope.clone(), report });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt under deadline, heartbeat watchdog and shutdown
    ///
    /// An abandoned attempt is cancelled and then drained, so the engine can
    /// release its adapter session. A job that ignores cancellation is
    /// dropped after one more heartbeat window.
    async fn attempt(&self, job: &dyn SyncJob, scope: &Scope) -> Result<SyncReport, AttemptError> {
        let (heartbeat, monitor) = Heartbeat::new();
        let cancel = self.shutdown.child_token();
        let attempt_timeout = self.config.attempt_timeout;
        let heartbeat_timeout = self.config.heartbeat_timeout;

        let run = job.run(scope, &heartbeat, &cancel);
        tokio::pin!(run);

        let abandoned = tokio::select! {
            result = &mut run => {
                cancel.cancel();
                return result.map_err(AttemptError::from);
            }
            _ = tokio::time::sleep(attempt_timeout) => AttemptError::TimedOut(attempt_timeout),
            _ = monitor.flatlined(heartbeat_timeout) => AttemptError::HeartbeatLost(heartbeat_timeout),
            _ = self.shutdown.cancelled() => AttemptError::Cancelled,
        };
        cancel.cancel();

        match tokio::time::timeout(heartbeat_timeout, &mut run).await {
            Ok(Ok(report)) => {
                tracing::warn!(kind = job.kind(), scope = %scope, collected_at = report.collected_at, reason = %abandoned, "Abandoned attempt committed while draining");
            }
            Ok(Err(e)) => {
                tracing::debug!(kind = job.kind(), scope = %scope, error = %e, "Abandoned attempt drained");
            }
            Err(_) => {
                tracing::warn!(kind = job.kind(), scope = %scope, "Abandoned attempt ignored cancellation, dropping it");
            }
        }
        Err(abandoned)
    }
}
