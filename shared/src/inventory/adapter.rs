//! Resource adapter contract
//!
//! One implementation per resource kind. The engine owns everything else
//! (diffing, history, transactions, retries); an adapter only knows how to
//! talk to its provider and how to map provider payloads.

use async_trait::async_trait;

use super::error::{ConversionError, TransportError};
use super::record::{Record, Scope};

/// One page of raw provider items
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Token for the next page, `None` on the last page
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.next_token.is_some()
    }
}

#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Raw provider payload
    type Raw: Send;
    /// Per-pass client context, created on `connect` and released on
    /// `disconnect`. Never cached across passes.
    type Session: Send + Sync;

    /// Resource kind identifier, e.g. `compute_instance`
    fn kind(&self) -> &str;

    async fn connect(&self, scope: &Scope) -> Result<Self::Session, TransportError>;

    async fn disconnect(&self, session: Self::Session) {
        drop(session);
    }

    async fn fetch(
        &self,
        session: &Self::Session,
        scope: &Scope,
        page_token: Option<&str>,
    ) -> Result<Page<Self::Raw>, TransportError>;

    fn convert(
        &self,
        raw: Self::Raw,
        scope: &Scope,
        collected_at: i64,
    ) -> Result<Record, ConversionError>;

    /// Natural key of a converted record
    fn key<'r>(&self, record: &'r Record) -> &'r str {
        &record.key
    }
}
