//! Pipeline configuration.
//!
//! Every knob has the production default; `validate()` fails fast on values that
//! would wedge the pipeline (zero capacities, zero intervals, and so on).

use std::path::PathBuf;
use std::time::Duration;

use abstractgateway::MAX_BATCH_SIZE;

use crate::routing::zonerouter::{ZoneRouter, DEFAULT_ZONE_COUNT};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// -------------------------
/// Dispatcher (ingress side)
/// -------------------------
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent submissions allowed past the admission gate.
    pub admission_slots: usize,
    /// How long a submission may wait for a slot before `AdmissionTimeout`.
    pub admission_timeout: Duration,
    /// Bounded queue between ingress and publishing.
    pub queue_capacity: usize,
    /// Drain workers, each publishing on its own broker channel.
    pub publish_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            admission_slots: 1000,
            admission_timeout: Duration::from_secs(5),
            queue_capacity: 100_000,
            publish_workers: 1,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission_slots == 0 {
            return Err(invalid("dispatcher.admission_slots must be > 0"));
        }
        if self.admission_timeout.is_zero() {
            return Err(invalid("dispatcher.admission_timeout must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("dispatcher.queue_capacity must be > 0"));
        }
        if self.publish_workers == 0 {
            return Err(invalid("dispatcher.publish_workers must be > 0"));
        }
        Ok(())
    }
}

/// -------------------------
/// Broker topology
/// -------------------------
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Routing-key and queue-name prefix.
    pub prefix: String,
    pub exchange: String,
    pub dead_letter_exchange: String,
    /// Queue bound to the dead-letter exchange; `None` leaves dead letters unrouted.
    pub dead_letter_queue: Option<String>,
    pub zones: u32,
    pub max_queue_length: u64,
    /// Redeliveries before the broker dead-letters a message.
    pub delivery_limit: Option<u32>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            prefix: "validations".into(),
            exchange: "validations.exchange".into(),
            dead_letter_exchange: "validations.dlx".into(),
            dead_letter_queue: Some("validations.dead".into()),
            zones: DEFAULT_ZONE_COUNT,
            max_queue_length: 1_000_000,
            delivery_limit: Some(20),
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, v) in [
            ("prefix", &self.prefix),
            ("exchange", &self.exchange),
            ("dead_letter_exchange", &self.dead_letter_exchange),
        ] {
            if v.trim().is_empty() {
                return Err(invalid(format!("topology.{field} must not be empty")));
            }
        }
        if self.exchange == self.dead_letter_exchange {
            return Err(invalid("topology.exchange and dead_letter_exchange must differ"));
        }
        if self.zones == 0 {
            return Err(invalid("topology.zones must be > 0"));
        }
        if self.max_queue_length == 0 {
            return Err(invalid("topology.max_queue_length must be > 0"));
        }
        if self.delivery_limit == Some(0) {
            return Err(invalid("topology.delivery_limit must be > 0 when set"));
        }
        Ok(())
    }

    pub fn router(&self) -> ZoneRouter {
        ZoneRouter::new(self.prefix.clone(), self.zones)
    }
}

/// -------------------------
/// Durability cache
/// -------------------------
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub base_path: PathBuf,
    /// Buffered events that trigger a disk flush.
    pub flush_threshold: usize,
    /// Move replayed files to `<base>/replayed` after startup recovery.
    pub archive_after_replay: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./validation-cache"),
            flush_threshold: 1000,
            archive_after_replay: true,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(invalid("cache.base_path must not be empty"));
        }
        if self.flush_threshold == 0 {
            return Err(invalid("cache.flush_threshold must be > 0"));
        }
        Ok(())
    }
}

/// -------------------------
/// Persistence retry
/// -------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total persist attempts per event; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Immediate, endless requeue.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Whether an event that has already failed `attempts` times may go again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Delay before requeueing after the `attempts`-th failure (1-based), doubling each time.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempts.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(invalid("retry.max_attempts must be > 0 when set"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(invalid("retry.max_backoff must be >= initial_backoff"));
        }
        Ok(())
    }
}

/// -------------------------
/// Consumer pipeline
/// -------------------------
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries allowed per zone consumer.
    pub prefetch: usize,
    /// Shared processing channel between zone consumers and the batcher.
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_concurrent_persists: usize,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1000,
            channel_capacity: 10_000,
            batch_size: MAX_BATCH_SIZE,
            flush_interval: Duration::from_secs(5),
            max_concurrent_persists: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(invalid("consumer.prefetch must be > 0"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("consumer.channel_capacity must be > 0"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(format!(
                "consumer.batch_size must be in 1..={MAX_BATCH_SIZE}"
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("consumer.flush_interval must be > 0"));
        }
        if self.max_concurrent_persists == 0 {
            return Err(invalid("consumer.max_concurrent_persists must be > 0"));
        }
        self.retry.validate()
    }
}

/// High-level config for the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub dispatcher: DispatcherConfig,
    pub topology: TopologyConfig,
    pub cache: CacheConfig,
    pub consumer: ConsumerConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatcher.validate()?;
        self.topology.validate()?;
        self.cache.validate()?;
        self.consumer.validate()?;
        Ok(())
    }

    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }
}

#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    cfg: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self {
            cfg: PipelineConfig::default(),
        }
    }

    pub fn dispatcher(mut self, d: DispatcherConfig) -> Self {
        self.cfg.dispatcher = d;
        self
    }

    pub fn topology(mut self, t: TopologyConfig) -> Self {
        self.cfg.topology = t;
        self
    }

    pub fn cache(mut self, c: CacheConfig) -> Self {
        self.cfg.cache = c;
        self
    }

    pub fn consumer(mut self, c: ConsumerConfig) -> Self {
        self.cfg.consumer = c;
        self
    }

    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cfg.cache.base_path = path.into();
        self
    }

    pub fn zones(mut self, zones: u32) -> Self {
        self.cfg.topology.zones = zones;
        self
    }

    pub fn retry(mut self, r: RetryPolicy) -> Self {
        self.cfg.consumer.retry = r;
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
