//! Storage collaborator contract.
//!
//! The consumer pipeline only needs one operation: persist a batch of events in
//! a single call. Atomicity of one call is the backend's job; deduplication
//! across calls is nobody's job (redelivery can produce duplicate rows).

use abstractgateway::ValidationEvent;
use async_trait::async_trait;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected batch: {0}")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Rejections are about the data, everything else about the backend.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Rejected(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ValidationStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert every event of `batch` in one call. Returns the number of rows written.
    async fn bulk_insert(&self, batch: &[ValidationEvent]) -> StoreResult<u64>;

    /// Release connections. Default: nothing to release.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
