//! Shared types for the inventory sync framework
//!
//! Types used by both resource adapters and the sync engine: the generic
//! record shape, the adapter contract and its error types, time utilities.

pub mod inventory;
pub mod util;

// Re-exports
pub use inventory::{
    ChildItem, ConversionError, Page, Record, ResourceAdapter, Scope, TransportError,
};
pub use serde::{Deserialize, Serialize};
