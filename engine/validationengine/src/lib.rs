pub mod config;
pub mod metrics;

pub mod routing {
    #[path = "zonerouter.rs"]
    pub mod zonerouter;
}

pub mod broker {
    #[path = "transport.rs"]
    pub mod transport;

    #[path = "memory.rs"]
    pub mod memory;

    #[path = "amqp.rs"]
    pub mod amqp;

    #[path = "topology.rs"]
    pub mod topology;

    #[path = "publisher.rs"]
    pub mod publisher;
}

pub mod durability {
    #[path = "localcache.rs"]
    pub mod localcache;
}

pub mod eventsystem {
    #[path = "dispatcher.rs"]
    pub mod dispatcher;
}

pub mod consumer {
    #[path = "batcher.rs"]
    pub mod batcher;

    #[path = "pipeline.rs"]
    pub mod pipeline;
}

#[cfg(test)]
mod testutil;

pub use broker::amqp::AmqpBroker;
pub use broker::memory::InMemoryBroker;
pub use broker::publisher::{BrokerPublisher, PublishFailure, PublishOutcome};
pub use broker::topology::Topology;
pub use broker::transport::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream};
pub use config::{
    CacheConfig, ConfigError, ConsumerConfig, DispatcherConfig, PipelineConfig, RetryPolicy, TopologyConfig,
};
pub use consumer::batcher::{Batcher, PendingEvent};
pub use consumer::pipeline::{ConsumerPipeline, DrainReport, PipelineError};
pub use durability::localcache::{CacheError, DurabilityCache, Recovery};
pub use eventsystem::dispatcher::{DispatchError, Dispatcher, DispatchWorkers};
pub use metrics::{AtomicMetrics, MetricsSnapshot, NoopMetrics, PipelineMetrics};
pub use routing::zonerouter::ZoneRouter;
