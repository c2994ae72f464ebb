//! Message types for actor communication.

use broker_core::{JobEvent, JobType};
use ractor::RpcReplyPort;

use crate::transport::Delivery;

/// Messages for a [`ConsumerActor`](crate::ConsumerActor).
#[derive(Debug)]
pub enum ConsumerMessage {
    /// Next item from the consumer stream; `None` is a null message.
    Delivery(Option<Delivery>),

    /// The broker closed the consumer stream.
    StreamEnded,

    /// Get counters for this consumer.
    GetStats { reply: RpcReplyPort<ConsumerStats> },
}

/// Running totals kept by a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub skipped: u64,
    /// Deliveries that could not be settled on the channel.
    pub errors: u64,
}

/// A running consumer as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Actor name; carries a `-restart-{n}` suffix once restarted.
    pub name: String,
    /// Connection service the consumer's channel is cached under.
    pub service: String,
    pub job_type: JobType,
    pub queue: String,
    pub restarts: u32,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Subscribe to events.
    Subscribe {
        sender: tokio::sync::broadcast::Sender<JobEvent>,
    },

    /// List the live consumers.
    ListConsumers { reply: RpcReplyPort<Vec<ConsumerInfo>> },

    /// Sweep old objects from storage.
    Cleanup,

    /// Stop consumers, close broker connections, then stop.
    Shutdown,
}
