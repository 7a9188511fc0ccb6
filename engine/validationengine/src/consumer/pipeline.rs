//! Zone consumers → shared processing channel → batcher → bulk persist.
//!
//! Deliveries are acknowledged as soon as their event is in the processing
//! channel, before it is persisted. A crash in between loses what was buffered;
//! the durability cache only covers failures the process lives through.

use std::sync::Arc;
use std::time::Instant;

use abstractdatabase::{StoreError, ValidationStore};
use abstractgateway::ValidationEvent;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::batcher::{Batcher, PendingEvent};
use crate::broker::topology::Topology;
use crate::broker::transport::{Broker, BrokerChannel, BrokerError, DeliveryStream};
use crate::config::{ConsumerConfig, RetryPolicy};
use crate::durability::localcache::DurabilityCache;
use crate::metrics::PipelineMetrics;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("processing channel closed while consumers were still running")]
    ProcessingChannelClosed,

    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What the final drain did with the leftovers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub persisted: usize,
    pub cached: usize,
}

/// Shared by the batcher and every persist task.
struct PersistContext {
    store: Arc<dyn ValidationStore>,
    cache: Arc<DurabilityCache>,
    metrics: Arc<dyn PipelineMetrics>,
    /// Persist slots. The batcher takes one before spawning, so a slow store
    /// stalls the batcher and backs up the processing channel.
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    requeue: mpsc::WeakSender<PendingEvent>,
    tracker: TaskTracker,
    /// Cancelled once the batcher stops; failures then go to the cache.
    draining: CancellationToken,
}

impl PersistContext {
    /// Wait for a persist slot, then persist in the background. Hands the
    /// batch back if `stop` fires first.
    async fn dispatch(
        self: &Arc<Self>,
        batch: Vec<PendingEvent>,
        stop: &CancellationToken,
    ) -> Result<(), Vec<PendingEvent>> {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(batch),
            permit = self.permits.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else { return Err(batch) };
        let ctx = self.clone();
        self.tracker.spawn(async move { ctx.persist(permit, batch).await });
        Ok(())
    }

    async fn persist(&self, permit: OwnedSemaphorePermit, batch: Vec<PendingEvent>) {
        let events: Vec<ValidationEvent> = batch.iter().map(|p| p.event.clone()).collect();
        let started = Instant::now();
        let result = self.store.bulk_insert(&events).await.map(|rows| (rows, started.elapsed()));
        // a retry may wait on the processing channel, which needs the batcher
        drop(permit);

        match result {
            Ok((rows, latency)) => {
                self.metrics.batch_persisted(events.len(), latency);
                debug!(rows, ?latency, store = self.store.name(), "batch persisted");
            }
            Err(e) => {
                self.metrics.persist_failed(events.len());
                warn!(size = events.len(), error = %e, store = self.store.name(), "batch persist failed");
                self.handle_failure(batch, &e).await;
            }
        }
    }

    async fn handle_failure(&self, batch: Vec<PendingEvent>, err: &StoreError) {
        let mut retry = Vec::with_capacity(batch.len());
        let mut exhausted = Vec::new();
        for mut p in batch {
            p.attempts = p.attempts.saturating_add(1);
            if err.is_retryable() && self.retry.allows_retry(p.attempts) {
                retry.push(p);
            } else {
                exhausted.push(p);
            }
        }
        if !exhausted.is_empty() {
            self.metrics.retries_exhausted(exhausted.len());
            warn!(count = exhausted.len(), "giving up on persisting, moving events to the disk cache");
            self.divert(exhausted).await;
        }
        if retry.is_empty() {
            return;
        }

        let attempts = retry.iter().map(|p| p.attempts).max().unwrap_or(1);
        let delay = self.retry.backoff(attempts);
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.draining.cancelled() => {}
            }
        }
        self.requeue(retry).await;
    }

    /// Put events back into the processing channel; falls back to the cache
    /// once the pipeline is draining.
    async fn requeue(&self, events: Vec<PendingEvent>) {
        let Some(tx) = self.requeue.upgrade() else {
            self.divert(events).await;
            return;
        };
        let count = events.len();
        let mut iter = events.into_iter();
        while let Some(p) = iter.next() {
            let permit = tokio::select! {
                biased;
                _ = self.draining.cancelled() => None,
                permit = tx.reserve() => permit.ok(),
            };
            match permit {
                Some(permit) => permit.send(p),
                None => {
                    let mut rest = vec![p];
                    rest.extend(iter);
                    self.divert(rest).await;
                    return;
                }
            }
        }
        self.metrics.events_requeued(count);
    }

    async fn divert(&self, events: Vec<PendingEvent>) {
        let count = events.len();
        let events = events.into_iter().map(|p| p.event).collect();
        if let Err(e) = self.cache.store_all(events).await {
            error!(count, error = %e, "events lost: cache store failed");
        }
    }
}

struct BatcherExit {
    batcher: Batcher,
    rx: mpsc::Receiver<PendingEvent>,
    result: Result<(), PipelineError>,
}

pub struct ConsumerPipeline {
    consumers: Vec<JoinHandle<()>>,
    batcher: JoinHandle<BatcherExit>,
    ctx: Arc<PersistContext>,
    batch_size: usize,
    stop_consumers: CancellationToken,
    stop_batcher: CancellationToken,
}

impl ConsumerPipeline {
    /// Start one consumer per zone queue plus the batcher. `fatal` is cancelled
    /// if the pipeline breaks down on its own.
    pub async fn start(
        broker: &dyn Broker,
        topology: &Topology,
        store: Arc<dyn ValidationStore>,
        cache: Arc<DurabilityCache>,
        metrics: Arc<dyn PipelineMetrics>,
        cfg: &ConsumerConfig,
        fatal: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel::<PendingEvent>(cfg.channel_capacity.max(1));
        let stop_consumers = CancellationToken::new();
        let stop_batcher = CancellationToken::new();

        let mut consumers = Vec::new();
        for (zone, queue) in topology.zone_queues() {
            let opened = async {
                let channel = broker.open_channel().await?;
                let stream = channel.consume(&queue, cfg.prefetch).await?;
                Ok::<_, BrokerError>((channel, stream))
            }
            .await;
            let (channel, stream) = match opened {
                Ok(pair) => pair,
                Err(e) => {
                    // consumers already running stop and drop their senders
                    stop_consumers.cancel();
                    return Err(e.into());
                }
            };
            consumers.push(tokio::spawn(run_zone_consumer(
                zone,
                queue,
                channel,
                stream,
                tx.clone(),
                stop_consumers.clone(),
                metrics.clone(),
            )));
        }

        let ctx = Arc::new(PersistContext {
            store,
            cache,
            metrics,
            permits: Arc::new(Semaphore::new(cfg.max_concurrent_persists.max(1))),
            retry: cfg.retry.clone(),
            requeue: tx.downgrade(),
            tracker: TaskTracker::new(),
            draining: stop_batcher.clone(),
        });
        // only the consumers keep the channel open from here on
        drop(tx);

        let batcher = tokio::spawn(run_batcher(
            rx,
            Batcher::new(cfg.batch_size, cfg.flush_interval),
            cfg.flush_interval,
            ctx.clone(),
            stop_batcher.clone(),
            stop_consumers.clone(),
            fatal,
        ));

        info!(
            consumers = consumers.len(),
            prefetch = cfg.prefetch,
            batch_size = cfg.batch_size,
            flush_interval = ?cfg.flush_interval,
            "consumer pipeline started"
        );
        Ok(Self {
            consumers,
            batcher,
            ctx,
            batch_size: cfg.batch_size.max(1),
            stop_consumers,
            stop_batcher,
        })
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Ordered stop: consumers, batcher, in-flight persists, then a last
    /// best-effort persist of everything left over. Whatever cannot be
    /// persisted ends up in the disk cache, which is flushed before the store
    /// is closed.
    pub async fn shutdown(self) -> Result<DrainReport, PipelineError> {
        let Self { consumers, batcher, ctx, batch_size, stop_consumers, stop_batcher } = self;

        stop_consumers.cancel();
        let mut join_error = None;
        for handle in consumers {
            if let Err(e) = handle.await {
                error!(error = %e, "zone consumer panicked");
                join_error.get_or_insert(e);
            }
        }

        stop_batcher.cancel();
        let BatcherExit { mut batcher, mut rx, result } = batcher.await?;

        ctx.tracker.close();
        ctx.tracker.wait().await;

        let mut leftovers: Vec<ValidationEvent> = batcher.take().into_iter().map(|p| p.event).collect();
        rx.close();
        while let Some(p) = rx.recv().await {
            leftovers.push(p.event);
        }

        let mut report = DrainReport::default();
        for chunk in leftovers.chunks(batch_size) {
            let started = Instant::now();
            match ctx.store.bulk_insert(chunk).await {
                Ok(_) => {
                    ctx.metrics.batch_persisted(chunk.len(), started.elapsed());
                    report.persisted += chunk.len();
                }
                Err(e) => {
                    ctx.metrics.persist_failed(chunk.len());
                    warn!(size = chunk.len(), error = %e, "final persist failed, caching");
                    if let Err(e) = ctx.cache.store_all(chunk.to_vec()).await {
                        error!(count = chunk.len(), error = %e, "events lost: cache store failed");
                    }
                    report.cached += chunk.len();
                }
            }
        }

        if let Err(e) = ctx.cache.flush().await {
            error!(error = %e, buffered = ctx.cache.buffered(), "final cache flush failed");
        }
        if let Err(e) = ctx.store.close().await {
            warn!(error = %e, "store close failed");
        }
        info!(persisted = report.persisted, cached = report.cached, "consumer pipeline stopped");

        result?;
        match join_error {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }
}

async fn run_zone_consumer(
    zone: u32,
    queue: String,
    channel: Box<dyn BrokerChannel>,
    mut stream: Box<dyn DeliveryStream>,
    tx: mpsc::Sender<PendingEvent>,
    stop: CancellationToken,
    metrics: Arc<dyn PipelineMetrics>,
) {
    debug!(zone, %queue, "zone consumer started");
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = stream.next() => match next {
                Some(d) => d,
                None => {
                    warn!(zone, %queue, "delivery stream ended");
                    break;
                }
            },
        };
        metrics.message_consumed();

        let event: ValidationEvent = match serde_json::from_slice(&delivery.body) {
            Ok(e) => e,
            Err(e) => {
                metrics.deserialization_failed();
                warn!(zone, routing_key = %delivery.routing_key, error = %e, "undecodable message, requeueing");
                if let Err(e) = delivery.nack(true).await {
                    warn!(zone, error = %e, "nack failed");
                }
                continue;
            }
        };

        let permit = tokio::select! {
            biased;
            // the unsettled delivery goes back to the broker when dropped
            _ = stop.cancelled() => break,
            permit = tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => permit.send(PendingEvent::new(event)),
            Err(_) => {
                error!(zone, "processing channel closed");
                break;
            }
        }
        if let Err(e) = delivery.ack().await {
            warn!(zone, error = %e, "ack failed");
        }
    }

    if let Err(e) = channel.close().await {
        warn!(zone, error = %e, "consumer channel close failed");
    }
    debug!(zone, %queue, "zone consumer stopped");
}

async fn run_batcher(
    mut rx: mpsc::Receiver<PendingEvent>,
    mut batcher: Batcher,
    flush_interval: std::time::Duration,
    ctx: Arc<PersistContext>,
    stop: CancellationToken,
    consumers_stopped: CancellationToken,
    fatal: CancellationToken,
) -> BatcherExit {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let result = loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            _ = ticker.tick() => {
                if !batcher.is_empty() {
                    debug!(size = batcher.len(), "timer flush");
                    if let Err(batch) = ctx.dispatch(batcher.take(), &stop).await {
                        batcher.restore(batch);
                        break Ok(());
                    }
                }
            }
            item = rx.recv() => match item {
                Some(p) => {
                    let ready = match batcher.push(p) {
                        Some(full) => Some(full),
                        None if batcher.is_due() => Some(batcher.take()),
                        None => None,
                    };
                    if let Some(batch) = ready {
                        if let Err(batch) = ctx.dispatch(batch, &stop).await {
                            batcher.restore(batch);
                            break Ok(());
                        }
                    }
                }
                None if consumers_stopped.is_cancelled() => break Ok(()),
                None => {
                    error!("processing channel closed unexpectedly, stopping the pipeline");
                    fatal.cancel();
                    break Err(PipelineError::ProcessingChannelClosed);
                }
            },
        }
    };
    BatcherExit { batcher, rx, result }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::publisher::BrokerPublisher;
    use crate::broker::transport::MessageProperties;
    use crate::config::{CacheConfig, DispatcherConfig, TopologyConfig};
    use crate::eventsystem::dispatcher::Dispatcher;
    use crate::metrics::AtomicMetrics;
    use crate::testutil::{event, event_at, NORD, SUD};
    use abstractdatabase::MemoryStore;

    struct Harness {
        broker: InMemoryBroker,
        topology: Arc<Topology>,
        store: Arc<MemoryStore>,
        cache: Arc<DurabilityCache>,
        metrics: Arc<AtomicMetrics>,
        fatal: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(topology: TopologyConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let broker = InMemoryBroker::new("test");
            let topology = Arc::new(Topology::new(topology));
            topology.declare(broker.open_channel().await.unwrap().as_ref()).await.unwrap();
            let metrics = Arc::new(AtomicMetrics::new());
            let cache_cfg = CacheConfig { base_path: dir.path().to_path_buf(), ..CacheConfig::default() };
            let cache = DurabilityCache::open(&cache_cfg, metrics.clone()).await.unwrap();
            Self {
                broker,
                topology,
                store: MemoryStore::new("mem"),
                cache,
                metrics,
                fatal: CancellationToken::new(),
                _dir: dir,
            }
        }

        async fn start(&self, cfg: &ConsumerConfig) -> ConsumerPipeline {
            self.start_with(cfg, self.store.clone()).await
        }

        async fn start_with(&self, cfg: &ConsumerConfig, store: Arc<dyn ValidationStore>) -> ConsumerPipeline {
            ConsumerPipeline::start(
                &self.broker,
                &self.topology,
                store,
                self.cache.clone(),
                self.metrics.clone(),
                cfg,
                self.fatal.clone(),
            )
            .await
            .unwrap()
        }

        async fn publish(&self, events: impl IntoIterator<Item = ValidationEvent>) {
            let publisher = BrokerPublisher::open(&self.broker, self.topology.clone(), self.cache.clone(), self.metrics.clone())
                .await
                .unwrap();
            for e in events {
                assert!(publisher.publish(&e).await.is_published());
            }
            publisher.close().await;
        }

        async fn wait_for_rows(&self, n: usize) {
            for _ in 0..10_000 {
                if self.store.row_count().await >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("only {} of {n} rows persisted", self.store.row_count().await);
        }
    }

    /// Holds every insert until `open` is cancelled, then writes through to `inner`.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        open: CancellationToken,
        entered: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ValidationStore for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        async fn bulk_insert(&self, batch: &[ValidationEvent]) -> abstractdatabase::StoreResult<u64> {
            self.entered.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.open.cancelled().await;
            self.inner.bulk_insert(batch).await
        }

        async fn close(&self) -> abstractdatabase::StoreResult<()> {
            self.inner.close().await
        }
    }

    fn consumer_cfg(batch_size: usize, retry: RetryPolicy) -> ConsumerConfig {
        ConsumerConfig { batch_size, retry, ..ConsumerConfig::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn fifteen_hundred_events_end_to_end() {
        let h = Harness::new(TopologyConfig::default()).await;
        let shutdown = CancellationToken::new();
        let (dispatcher, queue) = Dispatcher::new(DispatcherConfig::default(), shutdown.clone(), h.metrics.clone());
        let publisher = BrokerPublisher::open(&h.broker, h.topology.clone(), h.cache.clone(), h.metrics.clone())
            .await
            .unwrap();
        let workers = dispatcher.spawn_workers(queue, vec![publisher]);

        for seq in 0..1500 {
            let location = if seq % 2 == 0 { NORD } else { SUD };
            dispatcher.submit(event_at(seq, location)).await.unwrap();
        }
        shutdown.cancel();
        assert_eq!(workers.join().await.unwrap().published, 1500);

        assert_eq!(h.broker.queue_depth("validations.zone6"), Some(750));
        assert_eq!(h.broker.queue_depth("validations.zone3"), Some(750));
        for zone in [1, 2, 4, 5, 7, 8, 9, 10] {
            assert_eq!(h.broker.queue_depth(&format!("validations.zone{zone}")), Some(0));
        }
        let first = &h.broker.messages("validations.zone6")[0];
        assert_eq!(first.routing_key, "validations.zone6.EQ-000001");
        assert_eq!(first.properties.message_id.as_deref(), Some("EQ-000001_0"));

        let pipeline = h.start(&ConsumerConfig::default()).await;
        h.wait_for_rows(1500).await;
        assert_eq!(h.store.batch_sizes().await, vec![1000, 500]);

        let mut seqs: Vec<i64> = h.store.rows().await.iter().map(|e| e.sequence).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..1500).collect::<Vec<_>>());

        assert_eq!(pipeline.shutdown().await.unwrap(), DrainReport::default());
        assert_eq!(h.broker.queue_depth("validations.zone6"), Some(0));
        assert_eq!(h.broker.unacked_count("validations.zone6"), Some(0));
        assert!(h.store.is_closed());

        let snap = h.metrics.snapshot();
        assert_eq!(snap.received, 1500);
        assert_eq!(snap.published, 1500);
        assert_eq!(snap.consumed, 1500);
        assert_eq!(snap.events_persisted, 1500);
        assert_eq!(snap.cached, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_leaves_messages_unacknowledged_on_the_broker() {
        let h = Harness::new(TopologyConfig::default()).await;
        let gated = Arc::new(GatedStore {
            inner: h.store.clone(),
            open: CancellationToken::new(),
            entered: Default::default(),
        });
        let cfg = ConsumerConfig {
            channel_capacity: 10,
            batch_size: 1,
            max_concurrent_persists: 1,
            ..ConsumerConfig::default()
        };
        let pipeline = h.start_with(&cfg, gated.clone()).await;
        h.publish((0..2000).map(event)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(gated.entered.load(std::sync::atomic::Ordering::SeqCst), 1);
        let ready = h.broker.queue_depth("validations.zone6").unwrap();
        let unacked = h.broker.unacked_count("validations.zone6").unwrap();
        // one batch in the store, one waiting for a slot, a full channel
        let acked = 2000 - ready - unacked;
        assert!(acked <= 12, "{acked} events acknowledged while the store was stalled");

        gated.open.cancel();
        h.wait_for_rows(2000).await;
        assert_eq!(pipeline.shutdown().await.unwrap(), DrainReport::default());
        assert_eq!(h.broker.queue_depth("validations.zone6"), Some(0));
        assert_eq!(h.broker.unacked_count("validations.zone6"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_by_size_then_by_timer() {
        let h = Harness::new(TopologyConfig::default()).await;
        let pipeline = h.start(&consumer_cfg(3, RetryPolicy::default())).await;
        h.publish((0..7).map(event)).await;

        h.wait_for_rows(6).await;
        assert_eq!(h.store.batch_sizes().await, vec![3, 3]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.store.batch_sizes().await, vec![3, 3, 1]);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let h = Harness::new(TopologyConfig::default()).await;
        h.store.fail_next(1);
        let pipeline = h.start(&consumer_cfg(5, RetryPolicy::default())).await;
        h.publish((0..5).map(event)).await;

        h.wait_for_rows(5).await;
        assert_eq!(h.store.calls(), 2);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.persist_failed, 5);
        assert_eq!(snap.requeued, 5);
        assert_eq!(snap.cached, 0);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_go_to_the_cache() {
        let h = Harness::new(TopologyConfig::default()).await;
        h.store.set_available(false);
        let retry = RetryPolicy { max_attempts: Some(2), ..RetryPolicy::default() };
        let pipeline = h.start(&consumer_cfg(4, retry)).await;
        h.publish((0..4).map(event)).await;

        for _ in 0..1000 {
            if h.metrics.snapshot().retries_exhausted == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.metrics.snapshot().retries_exhausted, 4);
        assert_eq!(h.store.calls(), 2);

        assert_eq!(pipeline.shutdown().await.unwrap(), DrainReport::default());
        let recovered = h.cache.recover().await.unwrap();
        assert_eq!(recovered.events, (0..4).map(event).collect::<Vec<_>>());
        assert_eq!(h.store.row_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_persists_the_partial_batch() {
        let h = Harness::new(TopologyConfig::default()).await;
        let cfg = ConsumerConfig { flush_interval: Duration::from_secs(3600), ..ConsumerConfig::default() };
        let pipeline = h.start(&cfg).await;
        h.publish((0..10).map(event)).await;

        for _ in 0..100 {
            if h.metrics.snapshot().consumed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.store.row_count().await, 0);

        let report = pipeline.shutdown().await.unwrap();
        assert_eq!(report, DrainReport { persisted: 10, cached: 0 });
        assert_eq!(h.store.batch_sizes().await, vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_caches_what_cannot_be_persisted() {
        let h = Harness::new(TopologyConfig::default()).await;
        let cfg = ConsumerConfig { flush_interval: Duration::from_secs(3600), ..ConsumerConfig::default() };
        let pipeline = h.start(&cfg).await;
        h.publish((0..3).map(event)).await;
        for _ in 0..100 {
            if h.metrics.snapshot().consumed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.store.set_available(false);
        let report = pipeline.shutdown().await.unwrap();
        assert_eq!(report, DrainReport { persisted: 0, cached: 3 });
        assert_eq!(h.cache.recover().await.unwrap().events.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_messages_are_requeued_until_dead_lettered() {
        let topology = TopologyConfig { delivery_limit: Some(2), ..TopologyConfig::default() };
        let h = Harness::new(topology).await;
        let ch = h.broker.open_channel().await.unwrap();
        ch.publish(
            "validations.exchange",
            "validations.zone6.EQ-000001",
            b"{not an event".to_vec(),
            MessageProperties::default(),
            true,
        )
        .await
        .unwrap();

        let pipeline = h.start(&consumer_cfg(1, RetryPolicy::default())).await;
        h.publish([event(1)]).await;
        h.wait_for_rows(1).await;

        for _ in 0..100 {
            if h.broker.queue_depth("validations.dead") == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.broker.queue_depth("validations.dead"), Some(1));
        assert_eq!(h.metrics.snapshot().deserialization_failed, 3);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn losing_every_consumer_is_fatal() {
        let h = Harness::new(TopologyConfig { zones: 2, ..TopologyConfig::default() }).await;
        let pipeline = h.start(&ConsumerConfig::default()).await;
        assert_eq!(pipeline.consumer_count(), 2);

        h.broker.delete_queue("validations.zone1");
        h.broker.delete_queue("validations.zone2");
        tokio::time::timeout(Duration::from_secs(5), h.fatal.cancelled())
            .await
            .unwrap();

        assert!(matches!(pipeline.shutdown().await, Err(PipelineError::ProcessingChannelClosed)));
        assert!(h.store.is_closed());
    }
}
