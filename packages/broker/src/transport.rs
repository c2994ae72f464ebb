//! Message transport seam.
//!
//! The broker logic talks to AMQP through these three traits so that the
//! RabbitMQ client and the in-process broker are interchangeable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use broker_core::ExchangeKind;
use futures_util::stream::BoxStream;

/// Future type returned by transport methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Deliveries from a consumer. A `None` item is a delivery the transport
/// could not hand over (the AMQP client's null message).
pub type DeliveryStream = BoxStream<'static, Option<Delivery>>;

/// Transport-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("declare failed: {0}")]
    Declare(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("channel is closed")]
    Closed,
}

/// Optional `x-` arguments for a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-message-ttl`, milliseconds.
    pub message_ttl: Option<u32>,
    /// `x-dead-letter-exchange`.
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`.
    pub dead_letter_routing_key: Option<String>,
    /// `x-max-length`; overflow drops (and dead-letters) the oldest message.
    pub max_length: Option<u32>,
}

/// A message handed to a consumer; settle it with its `delivery_tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Opens connections to a broker URL.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str) -> BrokerFuture<'a, Arc<dyn MessageConnection>>;
}

pub trait MessageConnection: Send + Sync {
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn MessageChannel>>;

    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// AMQP channel operations used by the provisioner, producer and workers.
pub trait MessageChannel: Send + Sync {
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerFuture<'a, ()>;

    fn declare_queue<'a>(
        &'a self,
        name: &'a str,
        durable: bool,
        arguments: &'a QueueArguments,
    ) -> BrokerFuture<'a, ()>;

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        binding_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Limit unacknowledged deliveries per consumer started afterwards.
    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()>;

    /// Publish a persistent message.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
    ) -> BrokerFuture<'a, ()>;

    /// Start a manual-ack consumer on `queue`.
    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str)
    -> BrokerFuture<'a, DeliveryStream>;

    fn ack(&self, delivery_tag: u64) -> BrokerFuture<'_, ()>;

    fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerFuture<'_, ()>;

    fn close(&self) -> BrokerFuture<'_, ()>;
}
