//! Sync pass: diff, transactional upsert, stale reconciliation

pub mod diff;
mod engine;
mod error;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use diff::{ChildDiff, Diff};
pub use engine::{ReconcileReport, SyncEngine, SyncReport};
pub use error::{ErrorClass, ReconcileError, SyncError};
