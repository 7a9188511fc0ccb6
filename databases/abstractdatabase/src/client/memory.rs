use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use abstractgateway::ValidationEvent;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{StoreError, StoreResult, ValidationStore};

/// In-process store: keeps every persisted batch in memory.
///
/// Used when no database is configured and as the storage double in tests
/// (outages can be simulated with [`MemoryStore::set_available`] or
/// [`MemoryStore::fail_next`]).
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    batches: RwLock<Vec<Vec<ValidationEvent>>>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    calls: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub async fn batches(&self) -> Vec<Vec<ValidationEvent>> {
        self.batches.read().await.clone()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.read().await.iter().map(Vec::len).collect()
    }

    pub async fn rows(&self) -> Vec<ValidationEvent> {
        self.batches.read().await.iter().flatten().cloned().collect()
    }

    pub async fn row_count(&self) -> usize {
        self.batches.read().await.iter().map(Vec::len).sum()
    }

    /// Number of `bulk_insert` calls, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValidationStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bulk_insert(&self, batch: &[ValidationEvent]) -> StoreResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is offline", self.name)));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Backend("injected failure".into()));
        }

        if batch.is_empty() {
            return Ok(0);
        }
        self.batches.write().await.push(batch.to_vec());
        Ok(batch.len() as u64)
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evts(n: usize) -> Vec<ValidationEvent> {
        (0..n)
            .map(|i| ValidationEvent::new("EQ", "T", "L").with_sequence(i as i64))
            .collect()
    }

    #[tokio::test]
    async fn records_batches_in_order() {
        let store = MemoryStore::new("mem");
        assert_eq!(store.bulk_insert(&evts(3)).await.unwrap(), 3);
        assert_eq!(store.bulk_insert(&evts(2)).await.unwrap(), 2);
        assert_eq!(store.batch_sizes().await, vec![3, 2]);
        assert_eq!(store.row_count().await, 5);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = MemoryStore::new("mem");
        store.fail_next(2);
        assert!(store.bulk_insert(&evts(1)).await.is_err());
        assert!(store.bulk_insert(&evts(1)).await.is_err());
        assert!(store.bulk_insert(&evts(1)).await.is_ok());
        assert_eq!(store.row_count().await, 1);
    }

    #[tokio::test]
    async fn offline_store_refuses_everything() {
        let store = MemoryStore::new("mem");
        store.set_available(false);
        let err = store.bulk_insert(&evts(1)).await.unwrap_err();
        assert!(err.is_retryable());
        store.set_available(true);
        assert!(store.bulk_insert(&evts(1)).await.is_ok());
    }

    #[tokio::test]
    async fn close_is_recorded() {
        let store = MemoryStore::new("mem");
        store.close().await.unwrap();
        assert!(store.is_closed());
    }
}
