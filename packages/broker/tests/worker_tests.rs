//! Delivery handling against the in-process broker and an in-memory job store.

#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use broker::broker_core::{
    Executable, ExecutionTask, JobId, JobOutcome, JobRecord, JobRequest, JobStatus, JobType,
    QuantifyRequest, StatusUpdate, ValidationError,
};
use broker::{
    DeliveryOutcome, HandlerError, HandlerFuture, HookFuture, JobHandler, Producer, ProducerError,
    QuantificationHandler, Worker, job_handler,
};
use common::{FakeEngine, Harness, TestResult, next_delivery};
use db::repositories::{JobRepository, RepoFuture, SurrealJobRepository};

fn quantify_request() -> QuantifyRequest {
    let mut request = QuantifyRequest::with_models(["<opsa-mef/>"]);
    request.mocus = Some(true);
    request.probability = Some(true);
    request
}

/// Counts record creations on top of the real repository.
struct CountingRepository {
    inner: Arc<SurrealJobRepository>,
    created: AtomicUsize,
}

impl JobRepository for CountingRepository {
    fn create<'a>(&'a self, record: &'a JobRecord) -> RepoFuture<'a, JobRecord> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.inner.create(record)
    }

    fn find_by_id(&self, id: JobId) -> RepoFuture<'_, Option<JobRecord>> {
        self.inner.find_by_id(id)
    }

    fn update_status<'a>(
        &'a self,
        id: JobId,
        update: &'a StatusUpdate,
    ) -> RepoFuture<'a, JobRecord> {
        self.inner.update_status(id, update)
    }
}

async fn producer(harness: &Harness) -> Result<Producer, Box<dyn std::error::Error>> {
    Ok(Producer::new(
        harness.channel("producer").await?,
        harness.repository.clone(),
        harness.topology.clone(),
    ))
}

async fn worker(
    harness: &Harness,
    handler: Arc<dyn JobHandler>,
) -> Result<Worker, Box<dyn std::error::Error>> {
    let queue = harness.queue(handler.job_type()).name.clone();
    Ok(Worker::new(
        "worker-1",
        queue,
        harness.channel("worker").await?,
        harness.repository.clone(),
        handler,
    ))
}

#[tokio::test]
async fn quantification_job_is_recorded_before_ack() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let engine = FakeEngine::new(0, Some("<report/>"));
    let worker = worker(&harness, Arc::new(QuantificationHandler::new(engine.clone()))).await?;

    let job_id = producer(&harness)
        .await?
        .enqueue(JobRequest::Quantification(quantify_request()))
        .await?;
    let pending = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(pending.status, JobStatus::Pending);

    let queue = &harness.queue(JobType::Quantification).name;
    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(queue, "test").await?;
    let delivery = next_delivery(&mut deliveries).await?;

    assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::Acked);
    assert_eq!(engine.calls(), 1);

    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.results, vec!["<report/>".to_string()]);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.worker_id.as_deref(), Some("worker-1"));
    assert!(record.execution_time.is_some());

    assert_eq!(harness.broker.ready_count(queue).await, 0);
    assert_eq!(harness.broker.unacked_count(queue).await, 0);
    Ok(())
}

#[tokio::test]
async fn invalid_request_creates_nothing() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let repository = Arc::new(CountingRepository {
        inner: harness.repository.clone(),
        created: AtomicUsize::new(0),
    });
    let producer = Producer::new(
        harness.channel("producer").await?,
        repository.clone(),
        harness.topology.clone(),
    );

    let err = producer
        .enqueue(JobRequest::Quantification(QuantifyRequest::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ProducerError::Validation(_)));
    assert_eq!(repository.created.load(Ordering::SeqCst), 0);

    let queue = &harness.queue(JobType::Quantification).name;
    assert_eq!(harness.broker.ready_count(queue).await, 0);

    // The same producer does create a record for a valid request.
    producer
        .enqueue(JobRequest::Quantification(quantify_request()))
        .await?;
    assert_eq!(repository.created.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn null_delivery_is_skipped() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let worker = worker(
        &harness,
        Arc::new(QuantificationHandler::new(FakeEngine::new(0, None))),
    )
    .await?;

    let job_id = producer(&harness)
        .await?
        .enqueue(JobRequest::Quantification(quantify_request()))
        .await?;

    assert_eq!(worker.handle(None).await?, DeliveryOutcome::Skipped);

    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Pending);
    let queue = &harness.queue(JobType::Quantification).name;
    assert_eq!(harness.broker.ready_count(queue).await, 1);
    Ok(())
}

#[tokio::test]
async fn malformed_payload_goes_to_dead_letter_queue() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let engine = FakeEngine::new(0, None);
    let worker = worker(&harness, Arc::new(QuantificationHandler::new(engine.clone()))).await?;
    let config = harness.queue(JobType::Quantification).clone();

    let publisher = harness.channel("producer").await?;
    publisher
        .publish(&config.exchange.name, &config.exchange.routing_key, b"{\"models\": 42")
        .await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    let delivery = next_delivery(&mut deliveries).await?;

    assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::DeadLettered);
    assert_eq!(engine.calls(), 0);
    assert_eq!(harness.broker.ready_count(&config.name).await, 0);
    assert_eq!(harness.broker.ready_count(&config.dead_letter.name).await, 1);
    Ok(())
}

#[tokio::test]
async fn schema_violation_with_known_job_id_is_dead_lettered() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let engine = FakeEngine::new(0, None);
    let worker = worker(&harness, Arc::new(QuantificationHandler::new(engine.clone()))).await?;
    let config = harness.queue(JobType::Quantification).clone();

    let record = harness
        .repository
        .create(&JobRecord::new(JobType::Quantification, serde_json::json!({})))
        .await?;
    let wrong_type = serde_json::json!({ "job_id": record.id, "models": 42 });
    let missing_field = serde_json::json!({ "job_id": record.id, "mocus": true });

    let publisher = harness.channel("producer").await?;
    for body in [wrong_type, missing_field] {
        publisher
            .publish(
                &config.exchange.name,
                &config.exchange.routing_key,
                &serde_json::to_vec(&body)?,
            )
            .await?;
    }

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    for _ in 0..2 {
        let delivery = next_delivery(&mut deliveries).await?;
        assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::DeadLettered);
    }

    assert_eq!(engine.calls(), 0);
    let stored = harness.repository.find_by_id(record.id).await?.ok_or("missing record")?;
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(harness.broker.ready_count(&config.name).await, 0);
    assert_eq!(harness.broker.unacked_count(&config.name).await, 0);
    assert_eq!(harness.broker.ready_count(&config.dead_letter.name).await, 2);
    Ok(())
}

#[tokio::test]
async fn unknown_job_id_is_dead_lettered() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let engine = FakeEngine::new(0, None);
    let worker = worker(&harness, Arc::new(QuantificationHandler::new(engine.clone()))).await?;
    let config = harness.queue(JobType::Quantification).clone();

    let body = JobRequest::Quantification(quantify_request()).encode(JobId::new())?;
    harness
        .channel("producer")
        .await?
        .publish(&config.exchange.name, &config.exchange.routing_key, &body)
        .await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    let delivery = next_delivery(&mut deliveries).await?;

    assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::DeadLettered);
    assert_eq!(engine.calls(), 0);
    assert_eq!(harness.broker.ready_count(&config.dead_letter.name).await, 1);
    Ok(())
}

#[tokio::test]
async fn redelivery_of_finished_job_is_acked_without_rerun() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let engine = FakeEngine::new(0, Some("<report/>"));
    let worker = worker(&harness, Arc::new(QuantificationHandler::new(engine.clone()))).await?;
    let config = harness.queue(JobType::Quantification).clone();

    let request = JobRequest::Quantification(quantify_request());
    let job_id = producer(&harness).await?.enqueue(request.clone()).await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    let first = next_delivery(&mut deliveries).await?;
    assert_eq!(worker.handle(first).await?, DeliveryOutcome::Acked);

    // Same message published again, as after a lost acknowledgement.
    harness
        .channel("producer")
        .await?
        .publish(&config.exchange.name, &config.exchange.routing_key, &request.encode(job_id)?)
        .await?;
    let second = next_delivery(&mut deliveries).await?;
    assert_eq!(worker.handle(second).await?, DeliveryOutcome::Acked);

    assert_eq!(engine.calls(), 1);
    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(harness.broker.unacked_count(&config.name).await, 0);
    Ok(())
}

#[tokio::test]
async fn failing_engine_is_recorded_and_acked() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let handler = job_handler!(JobType::Executable, |_job_id, request| {
        match request {
            JobRequest::Executable(task) => {
                Ok(JobOutcome::from_exit(3, "", format!("{} crashed", task.executable)))
            }
            _ => Ok(JobOutcome::failed("unexpected job class")),
        }
    });
    let worker = worker(&harness, Arc::new(handler)).await?;
    let config = harness.queue(JobType::Executable).clone();

    let task = ExecutionTask::new(Executable::ScramCli).with_arguments(["--version"]);
    let job_id = producer(&harness)
        .await?
        .enqueue(JobRequest::Executable(task))
        .await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    let delivery = next_delivery(&mut deliveries).await?;
    assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::Acked);

    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.exit_code, Some(3));
    assert_eq!(harness.broker.ready_count(&config.dead_letter.name).await, 0);
    Ok(())
}

#[tokio::test]
async fn handler_error_becomes_failed_record() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let handler = job_handler!(JobType::Executable, |_job_id, _request| {
        Err(HandlerError::Validation(ValidationError::InvalidField {
            field: "arguments".into(),
            reason: "rejected".into(),
        }))
    });
    let worker = worker(&harness, Arc::new(handler)).await?;
    let config = harness.queue(JobType::Executable).clone();

    let job_id = producer(&harness)
        .await?
        .enqueue(JobRequest::Executable(ExecutionTask::new(Executable::Xfta)))
        .await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    let delivery = next_delivery(&mut deliveries).await?;
    assert_eq!(worker.handle(delivery).await?, DeliveryOutcome::Acked);

    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.is_some_and(|e| e.contains("rejected")));
    Ok(())
}

/// Succeeds, then fails its follow-up step a fixed number of times.
struct FlakyHook {
    failures: AtomicUsize,
    runs: AtomicUsize,
}

impl JobHandler for FlakyHook {
    fn job_type(&self) -> JobType {
        JobType::Executable
    }

    fn handle<'a>(&'a self, _job_id: JobId, _request: &'a JobRequest) -> HandlerFuture<'a> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(JobOutcome::from_exit(0, "ok", "")) })
    }

    fn on_recorded<'a>(
        &'a self,
        _job_id: JobId,
        _request: &'a JobRequest,
        _outcome: &'a JobOutcome,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(HandlerError::Io(std::io::Error::other("object store offline")));
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn failed_follow_up_requeues_then_acks_from_record() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let handler = Arc::new(FlakyHook {
        failures: AtomicUsize::new(1),
        runs: AtomicUsize::new(0),
    });
    let worker = worker(&harness, handler.clone())
        .await?
        .with_requeue_delay(Duration::from_millis(50));
    let config = harness.queue(JobType::Executable).clone();

    let job_id = producer(&harness)
        .await?
        .enqueue(JobRequest::Executable(ExecutionTask::new(Executable::Saphsolve)))
        .await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;

    let first = next_delivery(&mut deliveries).await?;
    let started = Instant::now();
    assert_eq!(worker.handle(first).await?, DeliveryOutcome::Requeued);
    assert!(started.elapsed() >= Duration::from_millis(50));

    let second = next_delivery(&mut deliveries).await?.ok_or("null delivery")?;
    assert!(second.redelivered);
    assert_eq!(worker.handle(Some(second)).await?, DeliveryOutcome::Acked);

    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn follow_up_that_keeps_failing_is_dead_lettered() -> TestResult {
    let harness = Harness::new().await?;
    harness.provision().await?;
    let handler = Arc::new(FlakyHook {
        failures: AtomicUsize::new(usize::MAX),
        runs: AtomicUsize::new(0),
    });
    let worker = worker(&harness, handler.clone())
        .await?
        .with_requeue_delay(Duration::from_millis(1))
        .with_max_follow_up_attempts(3);
    let config = harness.queue(JobType::Executable).clone();

    let job_id = producer(&harness)
        .await?
        .enqueue(JobRequest::Executable(ExecutionTask::new(Executable::Saphsolve)))
        .await?;

    let channel = harness.channel("worker").await?;
    let mut deliveries = channel.consume(&config.name, "test").await?;
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let delivery = next_delivery(&mut deliveries).await?;
        outcomes.push(worker.handle(delivery).await?);
    }
    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Requeued,
            DeliveryOutcome::Requeued,
            DeliveryOutcome::DeadLettered
        ]
    );

    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(harness.broker.ready_count(&config.name).await, 0);
    assert_eq!(harness.broker.unacked_count(&config.name).await, 0);
    assert_eq!(harness.broker.ready_count(&config.dead_letter.name).await, 1);
    Ok(())
}

#[tokio::test]
async fn publish_failure_leaves_record_pending() -> TestResult {
    let harness = Harness::new().await?;
    // Nothing provisioned, so the exchange does not exist.
    let err = producer(&harness)
        .await?
        .enqueue(JobRequest::Quantification(quantify_request()))
        .await
        .unwrap_err();

    let ProducerError::Publish { job_id, .. } = err else {
        panic!("expected a publish error, got {err:?}");
    };
    let record = harness.repository.find_by_id(job_id).await?.ok_or("missing record")?;
    assert_eq!(record.status, JobStatus::Pending);
    Ok(())
}
