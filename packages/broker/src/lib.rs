//! Job broker: queue topology, producers and the consumer actor system.
//!
//! # Architecture
//!
//! - [`QueueProvisioner`] declares each job class's exchanges and queues
//! - [`Producer`] persists a `pending` record, then publishes the job
//! - [`Supervisor`] owns one [`ConsumerActor`] per consumer slot
//! - [`Worker`] claims, runs and records each delivery before settling it
//!
//! The transport sits behind [`Connector`]; [`AmqpConnector`] talks to
//! RabbitMQ and [`MemoryBroker`] runs everything in process.
//!
//! # Usage
//!
//! ```ignore
//! use broker::{start_supervisor, SupervisorArgs, SupervisorMessage};
//!
//! let (supervisor, handle) = start_supervisor(args).await?;
//! supervisor.send_message(SupervisorMessage::Shutdown)?;
//! handle.await?;
//! ```

mod amqp;
mod config;
mod connection;
mod consumer;
mod engine;
mod handler;
mod memory;
mod messages;
mod producer;
mod provisioner;
mod supervisor;
mod topology;
mod transport;
mod worker;

pub use broker_core;

pub use amqp::AmqpConnector;
pub use config::{ConfigError, ConfigSource, EnvSource, parse_bool, parse_opt, parse_or, parse_required};
pub use connection::{ConnectionError, ConnectionManager, ConnectionSettings};
pub use consumer::{ConsumerActor, ConsumerArgs};
pub use engine::{
    Engine, EngineError, EngineFuture, EngineInvocation, EngineOutput, ProcessEngine,
    TIMEOUT_EXIT_CODE,
};
pub use handler::{
    ChildResult, ExecutableHandler, FanInReport, FnHandler, HandlerError, HandlerFuture,
    HookFuture, JobHandler, JobHandlerRegistry, QuantificationHandler, SequenceHandler,
    quantify_flags,
};
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnection, MemoryConnector};
pub use messages::{ConsumerInfo, ConsumerMessage, ConsumerStats, SupervisorMessage};
pub use producer::{FanOutJob, PRODUCER_SERVICE, Producer, ProducerError};
pub use provisioner::{ProvisionError, QueueProvisioner, primary_queue_arguments};
pub use supervisor::{CleanupSettings, Supervisor, SupervisorArgs, start_supervisor};
pub use topology::{QueueTopologyFactory, class_prefix};
pub use transport::{
    BrokerError, BrokerFuture, Connector, Delivery, DeliveryStream, MessageChannel,
    MessageConnection, QueueArguments,
};
pub use worker::{DeliveryOutcome, Worker};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
