//! Broker seam: the AMQP-style operations the pipeline needs, independent of
//! the client library behind them.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message, e.g. the target queue is full.
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// Mandatory publish that matched no queue.
    #[error("message unroutable: exchange '{exchange}', routing key '{routing_key}'")]
    Unroutable { exchange: String, routing_key: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Redeclaration with different arguments.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("channel closed")]
    ChannelClosed,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Str(s) => write!(f, "{s}"),
            ArgValue::Int(v) => write!(f, "{v}"),
        }
    }
}

pub type FieldTable = BTreeMap<String, ArgValue>;

pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_MAX_LENGTH: &str = "x-max-length";
pub const ARG_OVERFLOW: &str = "x-overflow";
pub const ARG_QUEUE_TYPE: &str = "x-queue-type";
pub const ARG_DELIVERY_LIMIT: &str = "x-delivery-limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub arguments: FieldTable,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: FieldTable::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        match self.arguments.get(key) {
            Some(ArgValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn arg_int(&self, key: &str) -> Option<i64> {
        match self.arguments.get(key) {
            Some(ArgValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<i64>,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// Settles one delivery on the broker side.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to a consumer. Settling consumes it, so a delivery can be
/// acknowledged at most once; dropping it unsettled leaves the decision to the
/// acker (the in-process broker requeues).
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            properties,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the consumer is cancelled or the queue is gone.
    async fn next(&mut self) -> Option<Delivery>;
}

/// One logical channel. Publishing and consuming should each get their own.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerResult<()>;

    /// With `mandatory`, a message that matches no queue is an error instead of
    /// being silently dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
        mandatory: bool,
    ) -> BrokerResult<()>;

    /// Start consuming with manual acknowledgement and `prefetch` unacked deliveries at most.
    async fn consume(&self, queue: &str, prefetch: usize) -> BrokerResult<Box<dyn DeliveryStream>>;

    async fn close(&self) -> BrokerResult<()>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn open_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>>;

    /// Closes the underlying connection. Channels still open are torn down with it.
    async fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}
