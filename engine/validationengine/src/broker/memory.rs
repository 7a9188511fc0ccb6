//! In-process broker with the AMQP semantics the pipeline relies on: durable
//! topic/fanout exchanges, bounded queues with `reject-publish` overflow,
//! dead-lettering, per-consumer prefetch credit and manual ack/nack.
//!
//! Used by the binary when no external broker is wired in, and by the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::transport::{
    Acker, Broker, BrokerChannel, BrokerError, BrokerResult, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, MessageProperties, QueueSpec, ARG_DEAD_LETTER_EXCHANGE,
    ARG_DELIVERY_LIMIT, ARG_MAX_LENGTH, ARG_OVERFLOW,
};

pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match p.split_first() {
            None => k.is_empty(),
            Some((&"#", rest)) => (0..=k.len()).any(|i| go(rest, &k[i..])),
            Some((&"*", rest)) => !k.is_empty() && go(rest, &k[1..]),
            Some((word, rest)) => k.first() == Some(word) && go(rest, &k[1..]),
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = routing_key.split('.').collect();
    go(&p, &k)
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    delivery_count: u32,
}

/// Snapshot of a message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery_count: u32,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn max_length(&self) -> Option<usize> {
        self.spec
            .arg_int(ARG_MAX_LENGTH)
            .and_then(|v| usize::try_from(v).ok())
    }

    fn is_full(&self) -> bool {
        self.max_length().map_or(false, |max| self.ready.len() >= max)
    }

    fn rejects_overflow(&self) -> bool {
        self.spec.arg_str(ARG_OVERFLOW) == Some("reject-publish")
    }

    fn dead_letter_exchange(&self) -> Option<String> {
        self.spec.arg_str(ARG_DEAD_LETTER_EXCHANGE).map(str::to_string)
    }

    fn delivery_limit(&self) -> Option<u32> {
        self.spec
            .arg_int(ARG_DELIVERY_LIMIT)
            .and_then(|v| u32::try_from(v).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct State {
    available: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
    published: u64,
    dead_lettered: u64,
}

impl State {
    fn new() -> Self {
        Self {
            available: true,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            next_tag: 0,
            published: 0,
            dead_lettered: 0,
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound { kind: "exchange", name: exchange.to_string() })?;

        let mut targets: Vec<String> = Vec::new();
        for b in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match spec.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.pattern == routing_key,
                ExchangeKind::Topic => topic_matches(&b.pattern, routing_key),
            };
            if hit && !targets.contains(&b.queue) {
                targets.push(b.queue.clone());
            }
        }
        Ok(targets)
    }

    fn publish(&mut self, exchange: &str, mandatory: bool, msg: Message) -> BrokerResult<()> {
        if !self.available {
            return Err(BrokerError::Unavailable("broker is down".into()));
        }
        let targets = self.route(exchange, &msg.routing_key)?;
        if targets.is_empty() {
            if mandatory {
                return Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: msg.routing_key,
                });
            }
            // accepted by the exchange, discarded for lack of a binding
            self.published += 1;
            return Ok(());
        }

        // all-or-nothing: a full reject-publish queue refuses the whole message
        for name in &targets {
            if let Some(q) = self.queues.get(name) {
                if q.rejects_overflow() && q.is_full() {
                    return Err(BrokerError::Rejected(format!(
                        "queue '{name}' is at its max length of {}",
                        q.ready.len()
                    )));
                }
            }
        }

        for name in targets {
            let mut dropped = None;
            if let Some(q) = self.queues.get_mut(&name) {
                if q.is_full() {
                    // drop-head overflow
                    dropped = q.ready.pop_front();
                }
                q.ready.push_back(msg.clone());
                q.notify.notify_waiters();
            }
            if let Some(old) = dropped {
                self.dead_letter(&name, old, "maxlen");
            }
        }
        self.published += 1;
        Ok(())
    }

    /// Re-route `msg` through the queue's dead-letter exchange, if it has one.
    /// Dead-lettered copies bypass overflow checks so this never cascades.
    fn dead_letter(&mut self, from_queue: &str, mut msg: Message, reason: &str) {
        self.dead_lettered += 1;
        let Some(dlx) = self.queues.get(from_queue).and_then(QueueState::dead_letter_exchange) else {
            tracing::debug!(queue = from_queue, reason, "message dropped, no dead-letter exchange");
            return;
        };
        let targets = match self.route(&dlx, &msg.routing_key) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(queue = from_queue, %dlx, error = %e, "dead-letter routing failed");
                return;
            }
        };

        msg.properties.headers.insert(DEATH_REASON_HEADER.into(), reason.into());
        msg.properties.headers.insert(DEATH_QUEUE_HEADER.into(), from_queue.into());
        msg.delivery_count = 0;
        for name in targets {
            if let Some(q) = self.queues.get_mut(&name) {
                q.ready.push_back(msg.clone());
                q.notify.notify_waiters();
            }
        }
    }

    fn settle(&mut self, queue: &str, tag: u64, outcome: Settle) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(msg) = q.unacked.remove(&tag) else {
            return;
        };
        let notify = q.notify.clone();

        let dead = match outcome {
            Settle::Ack => None,
            Settle::Reject => Some((msg, "rejected")),
            Settle::Requeue => {
                if q.delivery_limit().map_or(false, |limit| msg.delivery_count > limit) {
                    Some((msg, "delivery_limit"))
                } else {
                    q.ready.push_front(msg);
                    None
                }
            }
        };
        if let Some((msg, reason)) = dead {
            self.dead_letter(queue, msg, reason);
        }
        // freed prefetch credit or a requeued message
        notify.notify_waiters();
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    name: String,
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared { state: Mutex::new(State::new()) }),
        }
    }

    /// Simulate an outage: publishes and new channels fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
    }

    pub fn is_available(&self) -> bool {
        self.shared.lock().available
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| QueuedMessage {
                        exchange: m.exchange.clone(),
                        routing_key: m.routing_key.clone(),
                        body: m.body.clone(),
                        properties: m.properties.clone(),
                        delivery_count: m.delivery_count,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.shared.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.shared.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(exchange, pattern)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.shared
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.pattern.clone()))
            .collect()
    }

    /// Remove `queue`, its messages and bindings. Consumers on it see the end
    /// of their stream.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.shared.lock();
        let Some(q) = state.queues.remove(queue) else {
            return false;
        };
        state.bindings.retain(|b| b.queue != queue);
        q.notify.notify_waiters();
        true
    }

    /// Publishes the broker accepted, whether or not a queue took them.
    /// Refused publishes (outage, unroutable mandatory, full queue) are not counted.
    pub fn published_count(&self) -> u64 {
        self.shared.lock().published
    }

    pub fn dead_lettered_count(&self) -> u64 {
        self.shared.lock().dead_lettered
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        if !self.shared.lock().available {
            return Err(BrokerError::Unavailable(format!("{}: broker is down", self.name)));
        }
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("broker is down".into()));
        }
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared as {} (durable: {})",
                existing.name, existing.kind, existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("broker is down".into()));
        }
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' already declared with different arguments",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound { kind: "queue", name: queue.to_string() });
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound { kind: "exchange", name: exchange.to_string() });
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
        mandatory: bool,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let msg = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
            delivery_count: 0,
        };
        self.shared.lock().publish(exchange, mandatory, msg)
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> BrokerResult<Box<dyn DeliveryStream>> {
        self.ensure_open()?;
        if !self.shared.lock().queues.contains_key(queue) {
            return Err(BrokerError::NotFound { kind: "queue", name: queue.to_string() });
        }
        Ok(Box::new(MemoryDeliveryStream {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            prefetch: prefetch.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            channel_open: self.open.clone(),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            let state = self.shared.lock();
            // wake consumers parked on this channel so they observe the close
            for q in state.queues.values() {
                q.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

struct MemoryDeliveryStream {
    shared: Arc<Shared>,
    queue: String,
    prefetch: usize,
    in_flight: Arc<AtomicUsize>,
    channel_open: Arc<AtomicBool>,
}

enum Poll {
    Ready(Delivery),
    Wait(Arc<Notify>),
    Closed,
}

impl MemoryDeliveryStream {
    fn poll_once(&self) -> Poll {
        if !self.channel_open.load(Ordering::Acquire) {
            return Poll::Closed;
        }
        let mut state = self.shared.lock();
        state.next_tag += 1;
        let tag = state.next_tag;
        let Some(q) = state.queues.get_mut(&self.queue) else {
            return Poll::Closed;
        };
        if self.in_flight.load(Ordering::Acquire) >= self.prefetch {
            return Poll::Wait(q.notify.clone());
        }
        let Some(mut msg) = q.ready.pop_front() else {
            return Poll::Wait(q.notify.clone());
        };

        msg.delivery_count += 1;
        q.unacked.insert(tag, msg.clone());
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let redelivered = msg.delivery_count > 1;
        if redelivered {
            msg.properties
                .headers
                .insert(DELIVERY_COUNT_HEADER.into(), (msg.delivery_count - 1).to_string());
        }
        let acker = MemoryAcker {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            tag,
            in_flight: self.in_flight.clone(),
            channel_open: self.channel_open.clone(),
            settled: AtomicBool::new(false),
        };
        Poll::Ready(Delivery::new(
            msg.exchange,
            msg.routing_key,
            msg.body,
            msg.properties,
            redelivered,
            Box::new(acker),
        ))
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notify = match self.poll_once() {
                Poll::Ready(d) => return Some(d),
                Poll::Closed => return None,
                Poll::Wait(n) => n,
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // re-check after registering so a wakeup between the two is not lost
            match self.poll_once() {
                Poll::Ready(d) => return Some(d),
                Poll::Closed => return None,
                Poll::Wait(_) => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    in_flight: Arc<AtomicUsize>,
    channel_open: Arc<AtomicBool>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> BrokerResult<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        let mut state = self.shared.lock();
        if !self.channel_open.load(Ordering::Acquire) {
            // the broker takes back unacked deliveries of a closed channel
            state.settle(&self.queue, self.tag, Settle::Requeue);
            return Err(BrokerError::ChannelClosed);
        }
        state.settle(&self.queue, self.tag, outcome);
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(if requeue { Settle::Requeue } else { Settle::Reject })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let _ = self.settle(Settle::Requeue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transport::ARG_QUEUE_TYPE;
    use std::time::Duration;

    fn topic(name: &str) -> ExchangeSpec {
        ExchangeSpec { name: name.into(), kind: ExchangeKind::Topic, durable: true }
    }

    async fn setup(max_len: i64, limit: Option<i64>) -> (InMemoryBroker, Box<dyn BrokerChannel>) {
        let broker = InMemoryBroker::new("test");
        let ch = broker.open_channel().await.unwrap();
        ch.declare_exchange(&topic("ex")).await.unwrap();
        ch.declare_exchange(&ExchangeSpec {
            name: "dlx".into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        })
        .await
        .unwrap();
        let mut q = QueueSpec::durable("q")
            .with_arg(ARG_DEAD_LETTER_EXCHANGE, "dlx")
            .with_arg(ARG_MAX_LENGTH, max_len)
            .with_arg(ARG_OVERFLOW, "reject-publish")
            .with_arg(ARG_QUEUE_TYPE, "quorum");
        if let Some(l) = limit {
            q = q.with_arg(ARG_DELIVERY_LIMIT, l);
        }
        ch.declare_queue(&q).await.unwrap();
        ch.declare_queue(&QueueSpec::durable("dead")).await.unwrap();
        ch.bind_queue("q", "ex", "v.zone1.#").await.unwrap();
        ch.bind_queue("dead", "dlx", "").await.unwrap();
        (broker, ch)
    }

    async fn send(ch: &dyn BrokerChannel, key: &str, body: &str) -> BrokerResult<()> {
        ch.publish("ex", key, body.as_bytes().to_vec(), MessageProperties::default(), true)
            .await
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("v.zone1.#", "v.zone1.EQ-1"));
        assert!(topic_matches("v.zone1.#", "v.zone1"));
        assert!(topic_matches("v.zone1.#", "v.zone1.a.b"));
        assert!(!topic_matches("v.zone1.#", "v.zone10.EQ-1"));
        assert!(topic_matches("v.*.EQ", "v.zone3.EQ"));
        assert!(!topic_matches("v.*.EQ", "v.EQ"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("a.b", "a.b"));
        assert!(!topic_matches("a.b", "a.b.c"));
    }

    #[tokio::test]
    async fn mandatory_publish_needs_a_queue() {
        let (broker, ch) = setup(10, None).await;
        send(ch.as_ref(), "v.zone1.EQ", "x").await.unwrap();
        let err = send(ch.as_ref(), "v.zone2.EQ", "x").await.unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { .. }));
        ch.publish("ex", "v.zone2.EQ", vec![], MessageProperties::default(), false)
            .await
            .unwrap();
        // the unroutable mandatory publish was refused, the other one dropped
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn full_queue_rejects_publish() {
        let (broker, ch) = setup(2, None).await;
        send(ch.as_ref(), "v.zone1.a", "1").await.unwrap();
        send(ch.as_ref(), "v.zone1.a", "2").await.unwrap();
        let err = send(ch.as_ref(), "v.zone1.a", "3").await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
        assert_eq!(broker.queue_depth("q"), Some(2));
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_unless_args_differ() {
        let (_broker, ch) = setup(10, None).await;
        ch.declare_exchange(&topic("ex")).await.unwrap();
        let err = ch
            .declare_exchange(&ExchangeSpec { name: "ex".into(), kind: ExchangeKind::Fanout, durable: true })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
        let err = ch.declare_queue(&QueueSpec::durable("q")).await.unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let (broker, ch) = setup(100, None).await;
        for i in 0..3 {
            send(ch.as_ref(), "v.zone1.a", &i.to_string()).await.unwrap();
        }
        let consumer_ch = broker.open_channel().await.unwrap();
        let mut stream = consumer_ch.consume("q", 2).await.unwrap();
        let d1 = stream.next().await.unwrap();
        let _d2 = stream.next().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), stream.next()).await.is_err());
        assert_eq!(broker.unacked_count("q"), Some(2));

        d1.ack().await.unwrap();
        let d3 = stream.next().await.unwrap();
        assert_eq!(d3.body, b"2");
    }

    #[tokio::test]
    async fn nack_requeues_and_marks_redelivered() {
        let (broker, ch) = setup(100, None).await;
        send(ch.as_ref(), "v.zone1.a", "m").await.unwrap();
        let mut stream = ch.consume("q", 10).await.unwrap();
        let d = stream.next().await.unwrap();
        assert!(!d.redelivered);
        d.nack(true).await.unwrap();
        let d = stream.next().await.unwrap();
        assert!(d.redelivered);
        assert_eq!(d.properties.headers.get(DELIVERY_COUNT_HEADER).map(String::as_str), Some("1"));
        d.ack().await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.unacked_count("q"), Some(0));
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let (broker, ch) = setup(100, None).await;
        send(ch.as_ref(), "v.zone1.a", "m").await.unwrap();
        let mut stream = ch.consume("q", 10).await.unwrap();
        drop(stream.next().await.unwrap());
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn delivery_limit_dead_letters() {
        let (broker, ch) = setup(100, Some(1)).await;
        send(ch.as_ref(), "v.zone1.a", "poison").await.unwrap();
        let mut stream = ch.consume("q", 10).await.unwrap();
        stream.next().await.unwrap().nack(true).await.unwrap();
        stream.next().await.unwrap().nack(true).await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(0));
        let dead = broker.messages("dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"poison");
        assert_eq!(dead[0].properties.headers.get(DEATH_QUEUE_HEADER).map(String::as_str), Some("q"));
        assert_eq!(broker.dead_lettered_count(), 1);
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        let (broker, ch) = setup(100, None).await;
        send(ch.as_ref(), "v.zone1.a", "bad").await.unwrap();
        let mut stream = ch.consume("q", 10).await.unwrap();
        stream.next().await.unwrap().nack(false).await.unwrap();
        assert_eq!(broker.queue_depth("dead"), Some(1));
    }

    #[tokio::test]
    async fn closing_the_channel_ends_consumers() {
        let (broker, _ch) = setup(100, None).await;
        let consumer_ch = broker.open_channel().await.unwrap();
        let mut stream = consumer_ch.consume("q", 10).await.unwrap();
        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::task::yield_now().await;
        consumer_ch.close().await.unwrap();
        assert!(waiter.await.unwrap());
        assert!(matches!(consumer_ch.declare_queue(&QueueSpec::durable("x")).await, Err(BrokerError::ChannelClosed)));
    }

    #[tokio::test]
    async fn deleting_a_queue_ends_its_consumers() {
        let (broker, ch) = setup(100, None).await;
        let mut stream = ch.consume("q", 10).await.unwrap();
        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::task::yield_now().await;
        assert!(broker.delete_queue("q"));
        assert!(waiter.await.unwrap());
        assert!(broker.bindings("q").is_empty());
        assert!(!broker.delete_queue("q"));
    }

    #[tokio::test]
    async fn outage_fails_publishes_and_channels() {
        let (broker, ch) = setup(100, None).await;
        broker.set_available(false);
        assert!(matches!(send(ch.as_ref(), "v.zone1.a", "m").await, Err(BrokerError::Unavailable(_))));
        assert!(broker.open_channel().await.is_err());
        broker.set_available(true);
        send(ch.as_ref(), "v.zone1.a", "m").await.unwrap();
    }
}
