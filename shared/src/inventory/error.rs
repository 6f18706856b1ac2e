//! Adapter-side error types

use thiserror::Error;

/// Remote fetch failed (network, auth, quota, provider 5xx...)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("remote returned {status}: {message}")]
    Remote { status: u16, message: String },
}

/// A fetched item could not be mapped to a [`Record`](super::Record)
#[derive(Debug, Clone, Error)]
#[error("cannot convert {item}: {reason}")]
pub struct ConversionError {
    /// Best-effort identification of the offending item
    pub item: String,
    pub reason: String,
}

impl ConversionError {
    pub fn new(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            reason: reason.into(),
        }
    }
}
