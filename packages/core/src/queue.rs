//! Broker topology types for a job class.

use serde::{Deserialize, Serialize};

/// AMQP exchange type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(ExchangeKind::Direct),
            "fanout" => Some(ExchangeKind::Fanout),
            "topic" => Some(ExchangeKind::Topic),
            "headers" => Some(ExchangeKind::Headers),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange plus the keys used to bind to it and publish through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    /// Key used when binding a queue to this exchange.
    pub binding_key: String,
    /// Key used when publishing to this exchange.
    pub routing_key: String,
}

/// The dead-letter chain paired with a primary queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Dead-letter queue name.
    pub name: String,
    pub exchange: ExchangeConfig,
    /// Durability of the dead-letter queue.
    pub durable: bool,
}

/// Fully resolved topology for one job class.
///
/// Once provisioned the topology is immutable for the lifetime of the
/// process; changing it means redeploying the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Primary queue name.
    pub name: String,
    pub durable: bool,
    /// Per-message time-to-live in milliseconds.
    pub message_ttl: u32,
    /// Maximum number of ready messages before the oldest is dead-lettered.
    pub max_length: u32,
    /// Unacknowledged deliveries a consumer may hold; 0 leaves the channel default.
    pub prefetch: u16,
    pub exchange: ExchangeConfig,
    pub dead_letter: DeadLetterConfig,
}

impl QueueConfig {
    /// Routing key applied to messages dead-lettered out of the primary queue.
    pub fn dead_letter_routing_key(&self) -> &str {
        &self.dead_letter.exchange.routing_key
    }
}
