//! Fan-out of a quantification into per-sequence children and the fan-in.

#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;

use broker::broker_core::{JobEvent, JobStatus, JobType, MetadataStatus, QuantifyRequest};
use broker::{
    DeliveryOutcome, FanInReport, Producer, ProducerError, QuantificationHandler, SequenceHandler,
    Worker,
};
use common::{FakeEngine, Harness, TestResult, next_delivery};
use db::repositories::JobRepository;
use tokio::sync::broadcast;

fn sequences() -> Vec<String> {
    vec!["SEQ-1".to_string(), "SEQ-2".to_string()]
}

async fn run_children(
    harness: &Harness,
    engine: Arc<FakeEngine>,
    events: broadcast::Sender<JobEvent>,
    count: usize,
) -> TestResult {
    let config = harness.queue(JobType::DistributedSequenceChild).clone();
    let channel = harness.channel("sequence-worker").await?;
    let handler = SequenceHandler::new(QuantificationHandler::new(engine), harness.jobs.clone())
        .with_events(events);
    let worker = Worker::new(
        "sequence-worker-1",
        &config.name,
        channel.clone(),
        harness.repository.clone(),
        Arc::new(handler),
    );

    let mut deliveries = channel.consume(&config.name, "test").await?;
    for _ in 0..count {
        let delivery = next_delivery(&mut deliveries).await?;
        assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::Acked);
    }
    Ok(())
}

#[tokio::test]
async fn children_complete_the_parent() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let (events, mut rx) = broadcast::channel(64);

    let producer = Producer::new(
        harness.channel("producer").await?,
        harness.repository.clone(),
        harness.topology.clone(),
    )
    .with_storage(harness.jobs.clone());
    let fan_out = producer
        .enqueue_fan_out(QuantifyRequest::with_models(["<opsa-mef/>"]), "ET-LOCA", &sequences())
        .await?;
    assert_eq!(fan_out.child_job_ids.len(), 2);

    let parent_id = fan_out.parent_job_id.to_string();
    let metadata = harness.jobs.get_job_metadata(&parent_id).await?;
    assert_eq!(metadata.status, MetadataStatus::Pending);
    assert_eq!(metadata.input_id.as_deref(), Some(fan_out.input_id.as_str()));

    run_children(&harness, FakeEngine::new(0, Some("<report/>")), events, 2).await?;

    for job_id in &fan_out.child_job_ids {
        let record = harness.repository.find_by_id(*job_id).await?.ok_or("missing child")?;
        assert_eq!(record.status, JobStatus::Completed);
    }

    let metadata = harness.jobs.get_job_metadata(&parent_id).await?;
    assert_eq!(metadata.status, MetadataStatus::Completed);
    assert!(metadata.error.is_none());
    let output_id = metadata.output_id.ok_or("parent has no output")?;

    let report: FanInReport = serde_json::from_str(&harness.jobs.get_output_data(&output_id).await?)?;
    assert_eq!(report.parent_job_id, fan_out.parent_job_id);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);
    let sequences: Vec<&str> = report.children.iter().map(|c| c.sequence.as_str()).collect();
    assert_eq!(sequences, vec!["SEQ-1", "SEQ-2"]);

    let mut fan_in = None;
    while let Ok(event) = rx.try_recv() {
        if let JobEvent::FanInCompleted { output_id, .. } = event {
            fan_in = Some(output_id);
        }
    }
    assert_eq!(fan_in.as_deref(), Some(output_id.as_str()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_children_complete_the_parent_once() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let (events, mut rx) = broadcast::channel(64);
    let config = harness.queue(JobType::DistributedSequenceChild).clone();

    let producer = Producer::new(
        harness.channel("producer").await?,
        harness.repository.clone(),
        harness.topology.clone(),
    )
    .with_storage(harness.jobs.clone());
    let sequences: Vec<String> = (1..=4).map(|n| format!("SEQ-{n}")).collect();
    let fan_out = producer
        .enqueue_fan_out(QuantifyRequest::with_models(["<opsa-mef/>"]), "ET-LOCA", &sequences)
        .await?;

    // One delivery in hand per worker before any of them runs.
    let engine = FakeEngine::new(0, Some("<report/>"));
    let mut ready = Vec::new();
    for n in 1..=sequences.len() {
        let channel = harness.channel(&format!("sequence-worker-{n}")).await?;
        channel.set_prefetch(1).await?;
        let handler =
            SequenceHandler::new(QuantificationHandler::new(engine.clone()), harness.jobs.clone())
                .with_events(events.clone());
        let worker = Worker::new(
            format!("sequence-worker-{n}"),
            &config.name,
            channel.clone(),
            harness.repository.clone(),
            Arc::new(handler),
        );
        let mut deliveries = channel.consume(&config.name, "test").await?;
        ready.push((worker, next_delivery(&mut deliveries).await?, deliveries));
    }

    let tasks: Vec<_> = ready
        .into_iter()
        .map(|(worker, delivery, deliveries)| {
            tokio::spawn(async move {
                let outcome = worker.handle(delivery).await;
                drop(deliveries);
                outcome
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await??, DeliveryOutcome::Acked);
    }

    let metadata = harness
        .jobs
        .get_job_metadata(&fan_out.parent_job_id.to_string())
        .await?;
    assert_eq!(metadata.status, MetadataStatus::Completed);
    let output_id = metadata.output_id.ok_or("parent has no output")?;

    let outputs = harness.jobs.storage().list(&harness.jobs.areas().output).await?;
    assert_eq!(outputs.len(), 1);
    let report: FanInReport = serde_json::from_str(&harness.jobs.get_output_data(&output_id).await?)?;
    assert_eq!(report.completed, 4);

    let mut fan_ins = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let JobEvent::FanInCompleted { output_id, .. } = event {
            fan_ins.push(output_id);
        }
    }
    assert_eq!(fan_ins, vec![output_id]);
    Ok(())
}

#[tokio::test]
async fn failed_children_are_reported_on_the_parent() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let (events, _rx) = broadcast::channel(64);

    let producer = Producer::new(
        harness.channel("producer").await?,
        harness.repository.clone(),
        harness.topology.clone(),
    )
    .with_storage(harness.jobs.clone());
    let fan_out = producer
        .enqueue_fan_out(QuantifyRequest::with_models(["<opsa-mef/>"]), "ET-LOCA", &sequences())
        .await?;

    run_children(&harness, FakeEngine::new(1, None), events, 2).await?;

    let metadata = harness
        .jobs
        .get_job_metadata(&fan_out.parent_job_id.to_string())
        .await?;
    assert_eq!(metadata.status, MetadataStatus::Completed);
    assert_eq!(metadata.error.as_deref(), Some("2 of 2 child jobs failed"));
    Ok(())
}

#[tokio::test]
async fn fan_out_requires_storage_and_sequences() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let producer = Producer::new(
        harness.channel("producer").await?,
        harness.repository.clone(),
        harness.topology.clone(),
    );
    let request = QuantifyRequest::with_models(["<opsa-mef/>"]);

    let err = producer
        .enqueue_fan_out(request.clone(), "ET-LOCA", &sequences())
        .await
        .unwrap_err();
    assert!(matches!(err, ProducerError::StorageUnavailable));

    let producer = producer.with_storage(harness.jobs.clone());
    let err = producer
        .enqueue_fan_out(request, "ET-LOCA", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ProducerError::Validation(_)));

    let queue = &harness.queue(JobType::DistributedSequenceChild).name;
    assert_eq!(harness.broker.ready_count(queue).await, 0);
    Ok(())
}
