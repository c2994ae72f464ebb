//! Supervisor actor: provisions queues and owns the consumer actors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker_core::{JobEvent, JobType, QueueConfig};
use db::repositories::JobRepository;
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use storage::JobStorage;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ConfigSource, parse_or};
use crate::connection::ConnectionManager;
use crate::consumer::{ConsumerActor, ConsumerArgs};
use crate::handler::JobHandlerRegistry;
use crate::messages::{ConsumerInfo, ConsumerMessage, SupervisorMessage};
use crate::provisioner::QueueProvisioner;
use crate::worker::Worker;

const PROVISIONER_SERVICE: &str = "provisioner";
const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Age-based storage sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSettings {
    pub max_age: Duration,
    pub interval: Duration,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CleanupSettings {
    /// Read `STORAGE_CLEANUP_MAX_AGE_DAYS` and `STORAGE_CLEANUP_INTERVAL_SECS`.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        let days: u64 = parse_or(source, "STORAGE_CLEANUP_MAX_AGE_DAYS", 7)?;
        let interval: u64 = parse_or(source, "STORAGE_CLEANUP_INTERVAL_SECS", 24 * 60 * 60)?;
        Ok(Self {
            max_age: Duration::from_secs(days * 24 * 60 * 60),
            interval: Duration::from_secs(interval.max(1)),
        })
    }
}

/// Everything the supervisor needs to start consuming.
pub struct SupervisorArgs {
    pub manager: Arc<ConnectionManager>,
    pub repository: Arc<dyn JobRepository>,
    pub handlers: JobHandlerRegistry,
    /// Topology of each job class to consume.
    pub topology: HashMap<JobType, QueueConfig>,
    /// Consumers per job class.
    pub concurrency: usize,
    pub storage: Option<JobStorage>,
    pub cleanup: Option<CleanupSettings>,
    pub events: broadcast::Sender<JobEvent>,
}

struct ConsumerEntry {
    info: ConsumerInfo,
    slot: usize,
    actor: ActorRef<ConsumerMessage>,
}

/// What it takes to (re)start a consumer slot.
struct ConsumerContext {
    manager: Arc<ConnectionManager>,
    repository: Arc<dyn JobRepository>,
    handlers: JobHandlerRegistry,
    topology: HashMap<JobType, QueueConfig>,
    events: broadcast::Sender<JobEvent>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    context: ConsumerContext,
    consumers: Vec<ConsumerEntry>,
    storage: Option<JobStorage>,
    cleanup: Option<CleanupSettings>,
    ticker: Option<JoinHandle<()>>,
    shutting_down: bool,
}

/// Spawn consumer `slot` of `job_type` on the channel cached for that slot.
async fn spawn_consumer(
    myself: &ActorRef<SupervisorMessage>,
    context: &ConsumerContext,
    job_type: JobType,
    slot: usize,
    restarts: u32,
) -> Result<ConsumerEntry, ActorProcessingErr> {
    let config = context
        .topology
        .get(&job_type)
        .ok_or_else(|| ActorProcessingErr::from(format!("No topology for {job_type} jobs")))?;
    let handler = context
        .handlers
        .get(job_type)
        .ok_or_else(|| ActorProcessingErr::from(format!("No handler for {job_type} jobs")))?;

    let service = format!("{}-consumer-{slot}", job_type.as_str());
    let name = if restarts == 0 {
        service.clone()
    } else {
        format!("{service}-restart-{restarts}")
    };

    let channel = context.manager.get_channel(&service).await?;
    if config.prefetch > 0 {
        channel.set_prefetch(config.prefetch).await?;
    }

    let worker = Worker::new(
        format!("{}-worker-{slot}", job_type.as_str()),
        &config.name,
        Arc::clone(&channel),
        Arc::clone(&context.repository),
        handler,
    )
    .with_events(context.events.clone());
    let consumer_args = ConsumerArgs {
        worker: Arc::new(worker),
        channel,
        consumer_tag: name.clone(),
    };

    let (actor, _handle) = Actor::spawn_linked(
        Some(name.clone()),
        ConsumerActor,
        consumer_args,
        myself.get_cell(),
    )
    .await
    .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn consumer {name}: {e}")))?;

    Ok(ConsumerEntry {
        info: ConsumerInfo {
            name,
            service,
            job_type,
            queue: config.name.clone(),
            restarts,
        },
        slot,
        actor,
    })
}

/// Supervisor actor that owns every consumer in the process.
///
/// A consumer whose stream ends or whose actor fails is restarted on a fresh
/// connection. When that reconnect exhausts its retries the supervisor stops,
/// which ends the process.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job broker supervisor");

        // Every queue is provisioned before any consumer starts.
        let channel = args.manager.get_channel(PROVISIONER_SERVICE).await?;
        for job_type in JobType::ALL {
            if let Some(config) = args.topology.get(&job_type) {
                QueueProvisioner.setup_queue(config, channel.as_ref()).await?;
            }
        }

        let context = ConsumerContext {
            manager: args.manager,
            repository: args.repository,
            handlers: args.handlers,
            topology: args.topology,
            events: args.events,
        };

        let mut consumers = Vec::new();
        for job_type in JobType::ALL {
            if !context.topology.contains_key(&job_type) {
                continue;
            }
            for slot in 1..=args.concurrency.max(1) {
                consumers.push(spawn_consumer(&myself, &context, job_type, slot, 0).await?);
            }
        }

        let ticker = match (&args.storage, args.cleanup) {
            (Some(_), Some(cleanup)) => {
                let myself = myself.clone();
                Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(cleanup.interval);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        if myself.send_message(SupervisorMessage::Cleanup).is_err() {
                            break;
                        }
                    }
                }))
            }
            _ => None,
        };

        tracing::info!(consumers = consumers.len(), "Job broker supervisor started");
        Ok(SupervisorState {
            context,
            consumers,
            storage: args.storage,
            cleanup: args.cleanup,
            ticker,
            shutting_down: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Subscribe { sender } => {
                let mut rx = state.context.events.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                });
            }

            SupervisorMessage::ListConsumers { reply } => {
                let _ = reply.send(state.consumers.iter().map(|c| c.info.clone()).collect());
            }

            SupervisorMessage::Cleanup => {
                if let (Some(storage), Some(cleanup)) = (&state.storage, state.cleanup) {
                    match storage.cleanup_old_files(cleanup.max_age).await {
                        Ok(report) => tracing::debug!(removed = report.total(), "Cleanup tick"),
                        Err(e) => tracing::warn!(error = %e, "Storage cleanup failed"),
                    }
                }
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                state.shutting_down = true;
                if let Some(ticker) = state.ticker.take() {
                    ticker.abort();
                }
                for consumer in state.consumers.drain(..) {
                    if let Err(e) = consumer
                        .actor
                        .stop_and_wait(Some("shutdown".to_string()), Some(CONSUMER_STOP_TIMEOUT))
                        .await
                    {
                        tracing::warn!(consumer = %consumer.info.name, error = %e, "Consumer did not stop cleanly");
                    }
                }
                state.context.manager.shutdown().await;
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => (cell, reason),
            SupervisionEvent::ActorFailed(cell, error) => (cell, Some(error.to_string())),
            _ => return Ok(()),
        };
        let id = cell.get_id();
        let Some(index) = state.consumers.iter().position(|c| c.actor.get_id() == id) else {
            return Ok(());
        };
        let stopped = state.consumers.remove(index);
        if state.shutting_down {
            return Ok(());
        }

        tracing::warn!(
            consumer = %stopped.info.name,
            reason = ?reason,
            "Consumer stopped, reconnecting"
        );
        state.context.manager.evict(&stopped.info.service).await;

        match spawn_consumer(
            &myself,
            &state.context,
            stopped.info.job_type,
            stopped.slot,
            stopped.info.restarts + 1,
        )
        .await
        {
            Ok(entry) => {
                tracing::info!(consumer = %entry.info.name, "Consumer restarted");
                state.consumers.push(entry);
            }
            Err(e) => {
                tracing::error!(
                    category = "connection",
                    consumer = %stopped.info.name,
                    error = %e,
                    "Could not restart consumer, stopping supervisor"
                );
                myself.stop(Some(format!("consumer {} could not restart", stopped.info.name)));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        Ok(())
    }
}

/// Start the supervisor; fails if any queue cannot be provisioned.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(Some("supervisor".to_string()), Supervisor, args).await
}
