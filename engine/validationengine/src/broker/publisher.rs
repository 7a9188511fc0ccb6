use std::sync::Arc;
use std::time::Instant;

use abstractgateway::ValidationEvent;
use chrono::Utc;
use tracing::{debug, error, warn};

use super::topology::Topology;
use super::transport::{Broker, BrokerChannel, BrokerError, BrokerResult, MessageProperties};
use crate::durability::localcache::DurabilityCache;
use crate::metrics::PipelineMetrics;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(thiserror::Error, Debug)]
pub enum PublishFailure {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug)]
pub enum PublishOutcome {
    Published {
        zone: u32,
        routing_key: String,
        message_id: String,
    },
    /// The event did not reach the broker. `cached` tells whether it made it
    /// into the durability cache instead.
    Failed { reason: PublishFailure, cached: bool },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// Publishes single events to their zone on a channel of its own.
pub struct BrokerPublisher {
    channel: Box<dyn BrokerChannel>,
    topology: Arc<Topology>,
    cache: Arc<DurabilityCache>,
    metrics: Arc<dyn PipelineMetrics>,
}

impl BrokerPublisher {
    pub async fn open(
        broker: &dyn Broker,
        topology: Arc<Topology>,
        cache: Arc<DurabilityCache>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> BrokerResult<Self> {
        let channel = broker.open_channel().await?;
        Ok(Self::new(channel, topology, cache, metrics))
    }

    pub fn new(
        channel: Box<dyn BrokerChannel>,
        topology: Arc<Topology>,
        cache: Arc<DurabilityCache>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self { channel, topology, cache, metrics }
    }

    /// One event, one broker message. Failures are diverted to the cache and
    /// reported, never raised.
    pub async fn publish(&self, event: &ValidationEvent) -> PublishOutcome {
        let started = Instant::now();
        let (zone, routing_key) = self
            .topology
            .router()
            .routing_key(&event.location, &event.equipment_id);
        let message_id = event.message_id();

        match self.try_publish(event, &routing_key, &message_id).await {
            Ok(()) => {
                self.metrics.message_published(started.elapsed());
                debug!(zone, %routing_key, %message_id, "event published");
                PublishOutcome::Published { zone, routing_key, message_id }
            }
            Err(reason) => {
                self.metrics.publish_failed();
                warn!(zone, %routing_key, %message_id, error = %reason, "publish failed, diverting to cache");
                let cached = match self.cache.store(event.clone()).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(%message_id, error = %e, "event lost: cache store failed");
                        false
                    }
                };
                PublishOutcome::Failed { reason, cached }
            }
        }
    }

    async fn try_publish(
        &self,
        event: &ValidationEvent,
        routing_key: &str,
        message_id: &str,
    ) -> Result<(), PublishFailure> {
        let body = serde_json::to_vec(event)?;
        let properties = MessageProperties {
            message_id: Some(message_id.to_string()),
            timestamp: Some(Utc::now().timestamp()),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
            ..Default::default()
        };
        self.channel
            .publish(self.topology.exchange_name(), routing_key, body, properties, true)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "publisher channel close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::transport::DeliveryStream;
    use crate::config::CacheConfig;
    use crate::metrics::AtomicMetrics;
    use crate::testutil::{event, event_at, tagged_event, SUD};

    struct Fixture {
        broker: InMemoryBroker,
        publisher: BrokerPublisher,
        cache: Arc<DurabilityCache>,
        metrics: Arc<AtomicMetrics>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new("test");
        let topology = Arc::new(Topology::default());
        let ch = broker.open_channel().await.unwrap();
        topology.declare(ch.as_ref()).await.unwrap();

        let metrics = Arc::new(AtomicMetrics::new());
        let cfg = CacheConfig { base_path: dir.path().to_path_buf(), ..CacheConfig::default() };
        let cache = DurabilityCache::open(&cfg, metrics.clone()).await.unwrap();
        let publisher = BrokerPublisher::open(&broker, topology, cache.clone(), metrics.clone())
            .await
            .unwrap();
        Fixture { broker, publisher, cache, metrics, _dir: dir }
    }

    #[tokio::test]
    async fn publishes_one_message_to_the_zone_queue() {
        let f = fixture().await;
        let evt = event(42);
        let outcome = f.publisher.publish(&evt).await;

        match outcome {
            PublishOutcome::Published { zone, routing_key, message_id } => {
                assert_eq!(zone, 6);
                assert_eq!(routing_key, "validations.zone6.EQ-000001");
                assert_eq!(message_id, "EQ-000001_42");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let msgs = f.broker.messages("validations.zone6");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].properties.message_id.as_deref(), Some("EQ-000001_42"));
        assert_eq!(msgs[0].properties.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert!(msgs[0].properties.persistent);
        let decoded: ValidationEvent = serde_json::from_slice(&msgs[0].body).unwrap();
        assert_eq!(decoded, evt);
        assert_eq!(f.metrics.snapshot().published, 1);
    }

    #[tokio::test]
    async fn metadata_survives_the_broker() {
        let f = fixture().await;
        let evt = tagged_event(7);
        assert!(f.publisher.publish(&evt).await.is_published());

        let ch = f.broker.open_channel().await.unwrap();
        let mut stream = ch.consume("validations.zone6", 10).await.unwrap();
        let delivery = stream.next().await.unwrap();
        let decoded: ValidationEvent = serde_json::from_slice(&delivery.body).unwrap();
        delivery.ack().await.unwrap();

        assert_eq!(decoded, evt);
        assert_eq!(decoded.metadata.len(), 2);
        assert_eq!(decoded.metadata["reader"], "R-1");
    }

    #[tokio::test]
    async fn routes_by_location() {
        let f = fixture().await;
        assert!(f.publisher.publish(&event_at(1, SUD)).await.is_published());
        assert_eq!(f.broker.queue_depth("validations.zone3"), Some(1));
        assert_eq!(f.broker.queue_depth("validations.zone6"), Some(0));
    }

    #[tokio::test]
    async fn broker_outage_diverts_to_cache() {
        let f = fixture().await;
        f.broker.set_available(false);
        let outcome = f.publisher.publish(&tagged_event(1)).await;
        assert!(matches!(
            outcome,
            PublishOutcome::Failed { reason: PublishFailure::Broker(BrokerError::Unavailable(_)), cached: true }
        ));

        f.broker.set_available(true);
        assert_eq!(f.broker.published_count(), 0);
        assert_eq!(f.broker.queue_depth("validations.zone6"), Some(0));

        assert_eq!(f.cache.buffered(), 1);
        f.cache.flush().await.unwrap();
        let recovered = f.cache.recover().await.unwrap().events;
        assert_eq!(recovered, vec![tagged_event(1)]);
        assert_eq!(recovered[0].metadata["firmware"], "4.2.1");

        let snap = f.metrics.snapshot();
        assert_eq!(snap.publish_failed, 1);
        assert_eq!(snap.cached, 1);
    }

    #[tokio::test]
    async fn closed_channel_fails_and_caches() {
        let f = fixture().await;
        f.publisher.close().await;
        let outcome = f.publisher.publish(&event(3)).await;
        assert!(matches!(
            outcome,
            PublishOutcome::Failed { reason: PublishFailure::Broker(BrokerError::ChannelClosed), cached: true }
        ));
    }
}
