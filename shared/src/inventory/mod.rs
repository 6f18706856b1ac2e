//! Inventory domain types shared by adapters and the sync engine

mod adapter;
mod error;
mod record;

pub use adapter::{Page, ResourceAdapter};
pub use error::{ConversionError, TransportError};
pub use record::{ChildItem, Record, Scope};
