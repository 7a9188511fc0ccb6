use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Hooks the pipeline calls at each stage. Every method defaults to a no-op so
/// sinks only override what they export.
pub trait PipelineMetrics: Send + Sync {
    fn validation_received(&self) {}
    fn admission_rejected(&self) {}
    fn message_published(&self, _latency: Duration) {}
    fn publish_failed(&self) {}
    fn events_cached(&self, _count: usize) {}
    fn message_consumed(&self) {}
    fn deserialization_failed(&self) {}
    fn batch_persisted(&self, _size: usize, _latency: Duration) {}
    fn persist_failed(&self, _size: usize) {}
    fn events_requeued(&self, _count: usize) {}
    /// Events that ran out of persist attempts and went to the disk cache.
    fn retries_exhausted(&self, _count: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl PipelineMetrics for NoopMetrics {}

/// Lock-free counters, readable through [`AtomicMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    received: AtomicU64,
    admission_rejected: AtomicU64,
    published: AtomicU64,
    publish_latency_us: AtomicU64,
    publish_failed: AtomicU64,
    cached: AtomicU64,
    consumed: AtomicU64,
    deserialization_failed: AtomicU64,
    batches_persisted: AtomicU64,
    events_persisted: AtomicU64,
    persist_failed: AtomicU64,
    requeued: AtomicU64,
    retries_exhausted: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub received: u64,
    pub admission_rejected: u64,
    pub published: u64,
    /// Mean publish latency in microseconds.
    pub publish_latency_avg_us: u64,
    pub publish_failed: u64,
    pub cached: u64,
    pub consumed: u64,
    pub deserialization_failed: u64,
    pub batches_persisted: u64,
    pub events_persisted: u64,
    pub persist_failed: u64,
    pub requeued: u64,
    pub retries_exhausted: u64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let published = self.published.load(Ordering::Relaxed);
        let latency = self.publish_latency_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            admission_rejected: self.admission_rejected.load(Ordering::Relaxed),
            published,
            publish_latency_avg_us: if published == 0 { 0 } else { latency / published },
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            deserialization_failed: self.deserialization_failed.load(Ordering::Relaxed),
            batches_persisted: self.batches_persisted.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            persist_failed: self.persist_failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
        }
    }
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl PipelineMetrics for AtomicMetrics {
    fn validation_received(&self) {
        add(&self.received, 1);
    }

    fn admission_rejected(&self) {
        add(&self.admission_rejected, 1);
    }

    fn message_published(&self, latency: Duration) {
        add(&self.published, 1);
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.publish_latency_us.fetch_add(us, Ordering::Relaxed);
    }

    fn publish_failed(&self) {
        add(&self.publish_failed, 1);
    }

    fn events_cached(&self, count: usize) {
        add(&self.cached, count);
    }

    fn message_consumed(&self) {
        add(&self.consumed, 1);
    }

    fn deserialization_failed(&self) {
        add(&self.deserialization_failed, 1);
    }

    fn batch_persisted(&self, size: usize, _latency: Duration) {
        add(&self.batches_persisted, 1);
        add(&self.events_persisted, size);
    }

    fn persist_failed(&self, size: usize) {
        add(&self.persist_failed, size);
    }

    fn events_requeued(&self, count: usize) {
        add(&self.requeued, count);
    }

    fn retries_exhausted(&self, count: usize) {
        add(&self.retries_exhausted, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = AtomicMetrics::new();
        m.validation_received();
        m.validation_received();
        m.message_published(Duration::from_micros(100));
        m.message_published(Duration::from_micros(300));
        m.batch_persisted(1000, Duration::from_millis(3));
        m.events_cached(7);

        let s = m.snapshot();
        assert_eq!(s.received, 2);
        assert_eq!(s.published, 2);
        assert_eq!(s.publish_latency_avg_us, 200);
        assert_eq!(s.batches_persisted, 1);
        assert_eq!(s.events_persisted, 1000);
        assert_eq!(s.cached, 7);
        assert_eq!(s.persist_failed, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(AtomicMetrics::new().snapshot()).unwrap();
        assert_eq!(json["admissionRejected"], 0);
        assert_eq!(json["publishLatencyAvgUs"], 0);
    }
}
