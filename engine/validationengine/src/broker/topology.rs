use tracing::{debug, info};

use super::transport::{
    BrokerChannel, BrokerResult, ExchangeKind, ExchangeSpec, QueueSpec, ARG_DEAD_LETTER_EXCHANGE,
    ARG_DELIVERY_LIMIT, ARG_MAX_LENGTH, ARG_OVERFLOW, ARG_QUEUE_TYPE,
};
use crate::config::TopologyConfig;
use crate::routing::zonerouter::ZoneRouter;

/// Exchanges, zone queues and bindings of the validation pipeline.
#[derive(Debug, Clone)]
pub struct Topology {
    cfg: TopologyConfig,
    router: ZoneRouter,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(TopologyConfig::default())
    }
}

impl Topology {
    pub fn new(cfg: TopologyConfig) -> Self {
        let router = cfg.router();
        Self { cfg, router }
    }

    pub fn router(&self) -> &ZoneRouter {
        &self.router
    }

    pub fn exchange_name(&self) -> &str {
        &self.cfg.exchange
    }

    pub fn exchange(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.cfg.exchange.clone(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    pub fn dead_letter_exchange(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.cfg.dead_letter_exchange.clone(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }

    pub fn dead_letter_queue(&self) -> Option<QueueSpec> {
        self.cfg.dead_letter_queue.as_ref().map(QueueSpec::durable)
    }

    pub fn zone_queue(&self, zone: u32) -> QueueSpec {
        let mut spec = QueueSpec::durable(self.router.queue_name(zone))
            .with_arg(ARG_DEAD_LETTER_EXCHANGE, self.cfg.dead_letter_exchange.as_str())
            .with_arg(ARG_MAX_LENGTH, i64::try_from(self.cfg.max_queue_length).unwrap_or(i64::MAX))
            .with_arg(ARG_OVERFLOW, "reject-publish")
            .with_arg(ARG_QUEUE_TYPE, "quorum");
        if let Some(limit) = self.cfg.delivery_limit {
            spec = spec.with_arg(ARG_DELIVERY_LIMIT, i64::from(limit));
        }
        spec
    }

    /// `(zone, queue name)` for every zone.
    pub fn zone_queues(&self) -> Vec<(u32, String)> {
        self.router
            .zones()
            .map(|z| (z, self.router.queue_name(z)))
            .collect()
    }

    /// Declare everything; safe to run again against an already-declared broker.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> BrokerResult<()> {
        let exchange = self.exchange();
        let dlx = self.dead_letter_exchange();
        channel.declare_exchange(&exchange).await?;
        channel.declare_exchange(&dlx).await?;

        if let Some(dead) = self.dead_letter_queue() {
            channel.declare_queue(&dead).await?;
            // fanout ignores the pattern
            channel.bind_queue(&dead.name, &dlx.name, "").await?;
        }

        for zone in self.router.zones() {
            let queue = self.zone_queue(zone);
            let pattern = self.router.binding_pattern(zone);
            channel.declare_queue(&queue).await?;
            channel.bind_queue(&queue.name, &exchange.name, &pattern).await?;
            debug!(queue = %queue.name, %pattern, "zone queue declared");
        }

        info!(
            exchange = %exchange.name,
            dead_letter_exchange = %dlx.name,
            zones = self.router.zone_count(),
            "broker topology declared"
        );
        Ok(())
    }
}
