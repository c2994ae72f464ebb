//! `job-broker`: provisions the queues of the configured job classes and
//! consumes them until interrupted.

mod settings;

use std::sync::Arc;

use broker::broker_core::{JobEvent, JobType};
use broker::{
    AmqpConnector, ConnectionManager, Connector, Engine, EnvSource, ExecutableHandler,
    JobHandlerRegistry, MemoryBroker, ProcessEngine, QuantificationHandler, QueueTopologyFactory,
    SequenceHandler, SupervisorArgs, SupervisorMessage, start_supervisor,
};
use db::DbConfig;
use db::repositories::SurrealJobRepository;
use storage::JobStorage;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.try_init()
    };
}

fn engine(settings: &Settings) -> Arc<dyn Engine> {
    let mut engine = ProcessEngine::new();
    if let Some(dir) = &settings.engine_bin_dir {
        engine = engine.with_bin_dir(dir);
    }
    if let Some(timeout) = settings.engine_timeout {
        engine = engine.with_timeout(timeout);
    }
    Arc::new(engine)
}

fn handlers(
    settings: &Settings,
    jobs: Option<&JobStorage>,
    events: &broadcast::Sender<JobEvent>,
) -> Result<JobHandlerRegistry, Box<dyn std::error::Error>> {
    let engine = engine(settings);
    let mut handlers = JobHandlerRegistry::new();
    for job_type in &settings.job_classes {
        match job_type {
            JobType::Quantification => {
                handlers.register(QuantificationHandler::new(Arc::clone(&engine)));
            }
            JobType::Executable => {
                handlers.register(ExecutableHandler::new(Arc::clone(&engine)));
            }
            JobType::DistributedSequenceChild => {
                let jobs = jobs.ok_or("sequence jobs need object storage")?;
                let quantify = QuantificationHandler::new(Arc::clone(&engine));
                handlers.register(
                    SequenceHandler::new(quantify, jobs.clone()).with_events(events.clone()),
                );
            }
        }
    }
    Ok(handlers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    tracing::info!("Starting job broker");

    let settings = Settings::from_source(&EnvSource)?;
    let topology = QueueTopologyFactory::new(EnvSource).for_job_types(&settings.job_classes)?;

    let connector: Arc<dyn Connector> = if settings.uses_memory_broker() {
        tracing::warn!("Using the in-process broker; messages do not leave this process");
        Arc::new(MemoryBroker::new().connector())
    } else {
        Arc::new(AmqpConnector)
    };
    let manager = Arc::new(ConnectionManager::new(connector, settings.connection.clone()));

    let db = db::init(&DbConfig::from_env()).await?;
    let repository = Arc::new(SurrealJobRepository::new(db));

    let jobs = if settings.job_classes.contains(&JobType::DistributedSequenceChild) {
        let jobs = JobStorage::from_env().await?;
        if !jobs.is_healthy().await {
            tracing::warn!("Object storage did not answer the health check");
        }
        Some(jobs)
    } else {
        None
    };

    let (events, mut event_rx) = broadcast::channel::<JobEvent>(256);
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(event = %event.description(), "Job event");
        }
    });

    let handlers = handlers(&settings, jobs.as_ref(), &events)?;
    let (supervisor, mut handle) = start_supervisor(SupervisorArgs {
        manager,
        repository,
        handlers,
        topology,
        concurrency: settings.concurrency,
        cleanup: jobs.as_ref().map(|_| settings.cleanup),
        storage: jobs,
        events,
    })
    .await?;

    tracing::info!(
        job_classes = ?settings.job_classes,
        concurrency = settings.concurrency,
        "Job broker running"
    );

    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            false
        }
        stopped = &mut handle => {
            stopped?;
            true
        }
    };

    if stopped_early {
        tracing::error!("Supervisor stopped unexpectedly");
        return Err("supervisor stopped: broker connection lost".into());
    }

    tracing::info!("Interrupt received, shutting down");
    supervisor.send_message(SupervisorMessage::Shutdown)?;
    handle.await?;

    tracing::info!("Job broker stopped");
    Ok(())
}
