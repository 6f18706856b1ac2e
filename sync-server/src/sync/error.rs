//! Sync error taxonomy
//!
//! | Class | Source | Orchestrator |
//! |-------|--------|--------------|
//! | `Transport` | remote fetch / connect | retry with backoff |
//! | `Conversion` | malformed provider payload | retry (whole pass) |
//! | `Persistence` | redb commit / IO | retry |
//! | `Integrity` | ledger invariant violation | terminal, `integrity` log |
//! | `Cancelled` | caller stop | terminal |
//! | `Timeout` | attempt deadline / lost heartbeat | retry |

use serde::Serialize;
use shared::{ConversionError, TransportError};
use thiserror::Error;

use crate::rate_limit::RateLimitError;
use crate::store::StorageError;

/// Coarse failure class reported to the caller of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    Conversion,
    Persistence,
    Integrity,
    Cancelled,
    Timeout,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Integrity | ErrorClass::Cancelled)
    }
}

/// Failure of one `run` pass
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("sync pass cancelled")]
    Cancelled,
}

impl From<RateLimitError> for SyncError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Cancelled => SyncError::Cancelled,
        }
    }
}

impl From<redb::CommitError> for SyncError {
    fn from(err: redb::CommitError) -> Self {
        SyncError::Persistence(err.into())
    }
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport(_) => ErrorClass::Transport,
            SyncError::Conversion(_) => ErrorClass::Conversion,
            SyncError::Persistence(e) if e.is_integrity_fault() => ErrorClass::Integrity,
            SyncError::Persistence(_) => ErrorClass::Persistence,
            SyncError::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// Failure of a `reconcile` pass as a whole (per-entity failures are counted
/// in the report instead)
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(
        "cutoff {cutoff} for {kind}/{scope} is not the last successful pass ({last_success:?})"
    )]
    StaleCutoff {
        kind: String,
        scope: String,
        cutoff: i64,
        last_success: Option<i64>,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),
}
