//! In-process broker with RabbitMQ-like semantics.
//!
//! Backs `memory://` URLs for local runs and the test suite. Supports
//! direct, fanout and topic routing, the default exchange, per-consumer
//! prefetch, manual ack/nack, message TTL, `x-max-length` (drop-head) and
//! dead-letter routing. Nothing survives the process, durable or not.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use broker_core::ExchangeKind;
use futures_util::StreamExt;
use tokio::sync::{Mutex, Notify};

use crate::transport::{
    BrokerError, BrokerFuture, Connector, Delivery, DeliveryStream, MessageChannel,
    MessageConnection, QueueArguments,
};

/// Dead-letter cycles are cut after this many hops.
const MAX_DEAD_LETTER_HOPS: u8 = 8;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    enqueued_at: Instant,
}

impl StoredMessage {
    fn new(exchange: &str, routing_key: &str, body: Vec<u8>) -> Self {
        Self {
            body,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            enqueued_at: Instant::now(),
        }
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct QueueState {
    durable: bool,
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
}

struct ConsumerState {
    queue: String,
    prefetch: u16,
    in_flight: u16,
}

struct Unacked {
    channel: u64,
    consumer: String,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<(u64, String), ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Publish(format!("no exchange {exchange}")))?;

        let mut queues: Vec<String> = Vec::new();
        for (queue, key) in &state.bindings {
            let hit = match state.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if hit && !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, hops: u8) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state.ready.push_back(message);

        let mut overflow = Vec::new();
        if let Some(max_length) = state.arguments.max_length {
            while state.ready.len() > max_length as usize {
                match state.ready.pop_front() {
                    Some(dropped) => overflow.push(dropped),
                    None => break,
                }
            }
        }
        for dropped in overflow {
            self.dead_letter(queue, dropped, hops);
        }
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage, hops: u8) {
        if hops >= MAX_DEAD_LETTER_HOPS {
            tracing::warn!(queue = %queue, "Dropping message caught in a dead-letter cycle");
            return;
        }
        let Some(arguments) = self.queues.get(queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            return;
        };
        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());

        match self.route(&exchange, &routing_key) {
            Ok(targets) => {
                for target in targets {
                    let forwarded = StoredMessage::new(&exchange, &routing_key, message.body.clone());
                    self.enqueue(&target, forwarded, hops + 1);
                }
            }
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Dead-letter exchange unavailable");
            }
        }
    }

    fn pop_ready(&mut self, queue: &str) -> Option<StoredMessage> {
        let mut expired = Vec::new();
        let found = {
            let state = self.queues.get_mut(queue)?;
            let ttl = state
                .arguments
                .message_ttl
                .map(|ms| Duration::from_millis(u64::from(ms)));
            let mut found = None;
            while let Some(message) = state.ready.pop_front() {
                if ttl.is_some_and(|ttl| message.enqueued_at.elapsed() > ttl) {
                    expired.push(message);
                    continue;
                }
                found = Some(message);
                break;
            }
            found
        };
        for message in expired {
            self.dead_letter(queue, message, 0);
        }
        found
    }

    fn next_delivery(&mut self, channel: u64, consumer: &str) -> Option<Delivery> {
        let key = (channel, consumer.to_string());
        let state = self.consumers.get(&key)?;
        if state.prefetch > 0 && state.in_flight >= state.prefetch {
            return None;
        }
        let queue = state.queue.clone();
        let message = self.pop_ready(&queue)?;

        self.next_tag += 1;
        let delivery_tag = self.next_tag;
        if let Some(state) = self.consumers.get_mut(&key) {
            state.in_flight += 1;
        }
        let delivery = Delivery {
            delivery_tag,
            data: message.body.clone(),
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
        };
        self.unacked.insert(
            delivery_tag,
            Unacked {
                channel,
                consumer: consumer.to_string(),
                queue,
                message,
            },
        );
        Some(delivery)
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        match self.unacked.get(&delivery_tag) {
            Some(entry) if entry.channel == channel => {}
            _ => {
                return Err(BrokerError::Ack(format!(
                    "unknown delivery tag {delivery_tag}"
                )));
            }
        }
        let entry = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {delivery_tag}")))?;
        if let Some(consumer) = self.consumers.get_mut(&(entry.channel, entry.consumer.clone())) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(entry)
    }

    fn requeue(&mut self, entry: Unacked) {
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            let mut message = entry.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_channel: AtomicU64,
    refusing: AtomicBool,
}

/// Handle to one in-process broker; clones share the same exchanges and queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_channel: AtomicU64::new(0),
                refusing: AtomicBool::new(false),
            }),
        }
    }

    /// A connector whose connections all land on this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    fn wake(&self) {
        self.shared.notify.notify_waiters();
    }

    /// Refuse new connections while `refusing` is set; open ones are untouched.
    pub fn set_refusing_connections(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.shared.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().await.queues.contains_key(name)
    }

    pub async fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        let state = self.shared.state.lock().await;
        state.queues.get(name).map(|q| q.arguments.clone())
    }

    pub async fn is_bound(&self, exchange: &str, queue: &str, binding_key: &str) -> bool {
        let state = self.shared.state.lock().await;
        state.exchanges.get(exchange).is_some_and(|x| {
            x.bindings
                .iter()
                .any(|(q, k)| q == queue && k == binding_key)
        })
    }

    /// Messages waiting for a consumer.
    pub async fn ready_count(&self, queue: &str) -> usize {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.shared.state.lock().await;
        state.unacked.values().filter(|u| u.queue == queue).count()
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub async fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

/// Opens connections to a [`MemoryBroker`]; the URL is ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, _url: &'a str) -> BrokerFuture<'a, Arc<dyn MessageConnection>> {
        Box::pin(async move {
            if self.broker.shared.refusing.load(Ordering::SeqCst) {
                return Err(BrokerError::Connect("connection refused".to_string()));
            }
            Ok(Arc::new(MemoryConnection {
                broker: self.broker.clone(),
                channels: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }) as Arc<dyn MessageConnection>)
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    closed: AtomicBool,
}

impl MessageConnection for MemoryConnection {
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn MessageChannel>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            let id = self.broker.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
            let channel = Arc::new(MemoryChannel {
                broker: self.broker.clone(),
                id,
                prefetch: AtomicU16::new(0),
                closed: AtomicBool::new(false),
            });
            self.channels.lock().await.push(Arc::clone(&channel));
            Ok(channel as Arc<dyn MessageChannel>)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            let channels: Vec<Arc<MemoryChannel>> = self.channels.lock().await.drain(..).collect();
            for channel in channels {
                channel.shutdown().await;
            }
            Ok(())
        })
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    prefetch: AtomicU16,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Cancel this channel's consumers and return its unacked messages to their queues.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.broker.shared.state.lock().await;
        state.consumers.retain(|(channel, _), _| *channel != self.id);

        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = state.unacked.remove(&tag) {
                state.requeue(entry);
            }
        }
        drop(state);
        self.broker.wake();
    }
}

impl MessageChannel for MemoryChannel {
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if name.is_empty() {
                return Err(BrokerError::Declare(
                    "the default exchange cannot be declared".to_string(),
                ));
            }
            let mut state = self.broker.shared.state.lock().await;
            match state.exchanges.get(name) {
                Some(existing) if existing.kind != kind || existing.durable != durable => {
                    Err(BrokerError::Declare(format!(
                        "exchange {name} exists with different settings"
                    )))
                }
                Some(_) => Ok(()),
                None => {
                    state.exchanges.insert(
                        name.to_string(),
                        ExchangeState {
                            kind,
                            durable,
                            bindings: Vec::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    fn declare_queue<'a>(
        &'a self,
        name: &'a str,
        durable: bool,
        arguments: &'a QueueArguments,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if name.is_empty() {
                return Err(BrokerError::Declare("queue name must not be empty".to_string()));
            }
            let mut state = self.broker.shared.state.lock().await;
            match state.queues.get(name) {
                Some(existing) if existing.durable != durable || existing.arguments != *arguments => {
                    Err(BrokerError::Declare(format!(
                        "queue {name} exists with different settings"
                    )))
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        name.to_string(),
                        QueueState {
                            durable,
                            arguments: arguments.clone(),
                            ready: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        binding_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.shared.state.lock().await;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Bind(format!("no queue {queue}")));
            }
            let target = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| BrokerError::Bind(format!("no exchange {exchange}")))?;
            let binding = (queue.to_string(), binding_key.to_string());
            if !target.bindings.contains(&binding) {
                target.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            self.prefetch.store(count, Ordering::SeqCst);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.shared.state.lock().await;
            let targets = state.route(exchange, routing_key)?;
            if targets.is_empty() {
                tracing::debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable");
            }
            for queue in targets {
                state.enqueue(&queue, StoredMessage::new(exchange, routing_key, body.to_vec()), 0);
            }
            drop(state);
            self.broker.wake();
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            {
                let mut state = self.broker.shared.state.lock().await;
                if !state.queues.contains_key(queue) {
                    return Err(BrokerError::Consume(format!("no queue {queue}")));
                }
                let key = (self.id, consumer_tag.to_string());
                if state.consumers.contains_key(&key) {
                    return Err(BrokerError::Consume(format!(
                        "consumer tag {consumer_tag} already in use"
                    )));
                }
                state.consumers.insert(
                    key,
                    ConsumerState {
                        queue: queue.to_string(),
                        prefetch: self.prefetch.load(Ordering::SeqCst),
                        in_flight: 0,
                    },
                );
            }

            let seed = (self.broker.clone(), self.id, consumer_tag.to_string());
            let stream = futures_util::stream::unfold(seed, |(broker, channel, tag)| async move {
                loop {
                    let shared = Arc::clone(&broker.shared);
                    let notified = shared.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    {
                        let mut state = shared.state.lock().await;
                        if !state.consumers.contains_key(&(channel, tag.clone())) {
                            return None;
                        }
                        if let Some(delivery) = state.next_delivery(channel, &tag) {
                            drop(state);
                            return Some((Some(delivery), (broker, channel, tag)));
                        }
                    }
                    notified.await;
                }
            });
            Ok(stream.boxed())
        })
    }

    fn ack(&self, delivery_tag: u64) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.shared.state.lock().await;
            state.settle(self.id, delivery_tag)?;
            drop(state);
            self.broker.wake();
            Ok(())
        })
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.shared.state.lock().await;
            let entry = state.settle(self.id, delivery_tag)?;
            if requeue {
                state.requeue(entry);
            } else {
                let queue = entry.queue.clone();
                state.dead_letter(&queue, entry.message, 0);
            }
            drop(state);
            self.broker.wake();
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}
