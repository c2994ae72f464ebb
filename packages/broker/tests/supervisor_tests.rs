//! End-to-end run of the supervisor over the in-process broker.

#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashMap;
use std::time::Duration;

use broker::broker_core::{JobEvent, JobRequest, JobStatus, JobType, QuantifyRequest};
use broker::{
    ActorRef, ConsumerInfo, JobHandlerRegistry, Producer, QuantificationHandler, SupervisorArgs,
    SupervisorMessage, start_supervisor,
};
use common::{FakeEngine, Harness, TestResult};
use db::repositories::JobRepository;
use tokio::sync::broadcast;

async fn list_consumers(
    supervisor: &ActorRef<SupervisorMessage>,
) -> Result<Vec<ConsumerInfo>, Box<dyn std::error::Error>> {
    match ractor::rpc::call(
        supervisor,
        |reply| SupervisorMessage::ListConsumers { reply },
        Some(Duration::from_secs(1)),
    )
    .await?
    {
        ractor::rpc::CallResult::Success(consumers) => Ok(consumers),
        _ => Err("supervisor did not list its consumers".into()),
    }
}

#[tokio::test]
async fn supervisor_consumes_until_shutdown() -> TestResult {
    let harness = Harness::new().await?;
    let config = harness.queue(JobType::Quantification).clone();
    let topology = HashMap::from([(JobType::Quantification, config.clone())]);

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(QuantificationHandler::new(FakeEngine::new(0, Some("<report/>"))));

    let (events, _events_rx) = broadcast::channel(64);
    let (supervisor, handle) = start_supervisor(SupervisorArgs {
        manager: harness.manager.clone(),
        repository: harness.repository.clone(),
        handlers,
        topology: topology.clone(),
        concurrency: 2,
        storage: None,
        cleanup: None,
        events,
    })
    .await?;

    // Provisioned before the supervisor reported started.
    assert!(harness.broker.has_queue(&config.name).await);
    assert!(harness.broker.has_queue(&config.dead_letter.name).await);

    let (subscriber, mut rx) = broadcast::channel(64);
    supervisor.send_message(SupervisorMessage::Subscribe { sender: subscriber })?;

    // Handled after the subscription, so the forwarder is already listening.
    let consumers = list_consumers(&supervisor).await?;
    assert_eq!(consumers.len(), 2);
    assert!(consumers.iter().all(|c| c.queue == config.name && c.restarts == 0));

    let producer = Producer::connect(&harness.manager, harness.repository.clone(), topology).await?;
    let job_id = producer
        .enqueue(JobRequest::Quantification(QuantifyRequest::with_models(["<opsa-mef/>"])))
        .await?;

    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        while let Ok(event) = rx.recv().await {
            let done = matches!(&event, JobEvent::JobCompleted { job_id: id, .. } if *id == job_id);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await?;
    assert!(matches!(
        seen.first(),
        Some(JobEvent::JobStarted { job_id: id, .. }) if *id == job_id
    ));
    assert!(matches!(
        seen.last(),
        Some(JobEvent::JobCompleted { job_id: id, .. }) if *id == job_id
    ));

    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Completed);

    supervisor.send_message(SupervisorMessage::Shutdown)?;
    tokio::time::timeout(Duration::from_secs(5), handle).await??;
    assert_eq!(harness.broker.unacked_count(&config.name).await, 0);
    Ok(())
}
