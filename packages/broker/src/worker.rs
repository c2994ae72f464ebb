//! Per-delivery processing: validate, claim, execute, record, settle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_core::{JobEvent, JobId, JobOutcome, JobRecord, JobRequest, JobStatus, JobType, StatusUpdate};
use chrono::Utc;
use db::DbError;
use db::repositories::JobRepository;
use tokio::sync::broadcast;

use crate::handler::JobHandler;
use crate::transport::{BrokerError, Delivery, MessageChannel};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Null delivery; nothing to settle.
    Skipped,
    /// Terminal status recorded (now or earlier) and the message acknowledged.
    Acked,
    /// Rejected without requeue.
    DeadLettered,
    /// Rejected with requeue for another attempt.
    Requeued,
}

/// Pause before a delivery whose follow-up step failed goes back on the queue.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);
/// Follow-up failures tolerated per job before the message is dead-lettered.
pub const DEFAULT_MAX_FOLLOW_UP_ATTEMPTS: u32 = 5;

/// Processes deliveries from one queue, one at a time.
pub struct Worker {
    worker_id: String,
    job_type: JobType,
    queue: String,
    channel: Arc<dyn MessageChannel>,
    repository: Arc<dyn JobRepository>,
    handler: Arc<dyn JobHandler>,
    events: Option<broadcast::Sender<JobEvent>>,
    requeue_delay: Duration,
    max_follow_up_attempts: u32,
    follow_up_failures: Mutex<HashMap<JobId, u32>>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: impl Into<String>,
        channel: Arc<dyn MessageChannel>,
        repository: Arc<dyn JobRepository>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_type: handler.job_type(),
            queue: queue.into(),
            channel,
            repository,
            handler,
            events: None,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            max_follow_up_attempts: DEFAULT_MAX_FOLLOW_UP_ATTEMPTS,
            follow_up_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// At least one attempt is always made.
    pub fn with_max_follow_up_attempts(mut self, attempts: u32) -> Self {
        self.max_follow_up_attempts = attempts.max(1);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Process one delivery from the consumer stream.
    ///
    /// The message is acknowledged only after its terminal status has been
    /// written. Errors are broker failures while settling; the message then
    /// stays unacknowledged and is redelivered once the channel closes.
    pub async fn handle(&self, delivery: Option<Delivery>) -> Result<DeliveryOutcome, BrokerError> {
        let Some(delivery) = delivery else {
            tracing::error!(queue = %self.queue, worker_id = %self.worker_id, "Received a null message");
            return Ok(DeliveryOutcome::Skipped);
        };

        let message = match JobRequest::decode(self.job_type, &delivery.data) {
            Ok(message) => message,
            Err(e) => {
                return self
                    .dead_letter(&delivery, None, "invalid_payload", &e.to_string())
                    .await;
            }
        };
        let job_id = message.job_id;
        let request = message.body;

        let claim = StatusUpdate::Running {
            worker_id: self.worker_id.clone(),
        };
        match self.repository.update_status(job_id, &claim).await {
            Ok(_) => {
                tracing::info!(job_id = %job_id, worker_id = %self.worker_id, "Job started");
                self.emit(JobEvent::JobStarted {
                    job_id,
                    worker_id: self.worker_id.clone(),
                    timestamp: Utc::now(),
                });
            }
            Err(DbError::InvalidTransition { current, .. }) if current.is_terminal() => {
                return self.replay_recorded(&delivery, job_id, &request).await;
            }
            Err(DbError::InvalidTransition {
                current: JobStatus::Running,
                ..
            }) => {
                tracing::warn!(
                    job_id = %job_id,
                    redelivered = delivery.redelivered,
                    "Job already running, executing again"
                );
            }
            Err(e) => return self.state_store_failure(&delivery, job_id, &e).await,
        }

        let outcome = match self.handler.handle(job_id, &request).await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::failed(e.to_string()),
        };

        match self
            .repository
            .update_status(job_id, &StatusUpdate::Finished(outcome.clone()))
            .await
        {
            Ok(_) => self.report(job_id, &outcome),
            Err(DbError::InvalidTransition { current, .. }) if current.is_terminal() => {
                tracing::info!(job_id = %job_id, status = %current, "Job already recorded by another worker");
            }
            Err(e) => return self.state_store_failure(&delivery, job_id, &e).await,
        }

        self.finish(&delivery, job_id, &request, &outcome).await
    }

    fn report(&self, job_id: JobId, outcome: &JobOutcome) {
        let now = Utc::now();
        if outcome.is_success() {
            let duration_ms = outcome.execution_time.map(|t| t.total_ms).unwrap_or_default();
            tracing::info!(job_id = %job_id, duration_ms, "Job completed");
            self.emit(JobEvent::JobCompleted {
                job_id,
                duration_ms,
                timestamp: now,
            });
        } else {
            tracing::warn!(
                category = "job_failed",
                job_id = %job_id,
                exit_code = outcome.exit_code,
                error = outcome.error.as_deref().unwrap_or(""),
                "Job failed"
            );
            self.emit(JobEvent::JobFailed {
                job_id,
                exit_code: outcome.exit_code,
                timestamp: now,
            });
        }
    }

    /// Redelivery of a job whose result is already recorded: rerun the
    /// follow-up hook from the stored result and acknowledge.
    async fn replay_recorded(
        &self,
        delivery: &Delivery,
        job_id: JobId,
        request: &JobRequest,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let record = match self.repository.find_by_id(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return self
                    .state_store_failure(delivery, job_id, &DbError::NotFound(job_id))
                    .await;
            }
            Err(e) => return self.state_store_failure(delivery, job_id, &e).await,
        };
        tracing::info!(job_id = %job_id, status = %record.status, "Job already finished, acknowledging redelivery");
        self.finish(delivery, job_id, request, &recorded_outcome(&record))
            .await
    }

    async fn finish(
        &self,
        delivery: &Delivery,
        job_id: JobId,
        request: &JobRequest,
        outcome: &JobOutcome,
    ) -> Result<DeliveryOutcome, BrokerError> {
        if let Err(e) = self.handler.on_recorded(job_id, request, outcome).await {
            let attempts = self.count_follow_up_failure(job_id);
            if attempts >= self.max_follow_up_attempts {
                self.forget_follow_up_failures(job_id);
                return self
                    .dead_letter(delivery, Some(job_id), "follow_up", &e.to_string())
                    .await;
            }
            tracing::error!(
                category = "state_store",
                job_id = %job_id,
                attempts,
                delay_ms = self.requeue_delay.as_millis() as u64,
                error = %e,
                "Post-completion step failed, requeueing"
            );
            tokio::time::sleep(self.requeue_delay).await;
            self.channel.nack(delivery.delivery_tag, true).await?;
            return Ok(DeliveryOutcome::Requeued);
        }
        self.forget_follow_up_failures(job_id);
        self.channel.ack(delivery.delivery_tag).await?;
        Ok(DeliveryOutcome::Acked)
    }

    fn failure_counts(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, u32>> {
        self.follow_up_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count_follow_up_failure(&self, job_id: JobId) -> u32 {
        let mut failures = self.failure_counts();
        let attempts = failures.entry(job_id).or_default();
        *attempts += 1;
        *attempts
    }

    fn forget_follow_up_failures(&self, job_id: JobId) {
        self.failure_counts().remove(&job_id);
    }

    async fn state_store_failure(
        &self,
        delivery: &Delivery,
        job_id: JobId,
        error: &DbError,
    ) -> Result<DeliveryOutcome, BrokerError> {
        tracing::error!(
            category = "state_store",
            job_id = %job_id,
            error = %error,
            "Job status could not be recorded"
        );
        self.dead_letter(delivery, Some(job_id), "state_store", &error.to_string())
            .await
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        job_id: Option<JobId>,
        reason: &str,
        detail: &str,
    ) -> Result<DeliveryOutcome, BrokerError> {
        self.channel.nack(delivery.delivery_tag, false).await?;
        tracing::error!(
            category = "dead_letter",
            queue = %self.queue,
            job_id = job_id.map(|id| id.to_string()),
            reason,
            detail,
            "Message rejected to the dead-letter queue"
        );
        self.emit(JobEvent::MessageDeadLettered {
            queue: self.queue.clone(),
            job_id,
            reason: format!("{reason}: {detail}"),
            timestamp: Utc::now(),
        });
        Ok(DeliveryOutcome::DeadLettered)
    }
}

fn recorded_outcome(record: &JobRecord) -> JobOutcome {
    JobOutcome {
        status: record.status,
        results: record.results.clone(),
        exit_code: record.exit_code.unwrap_or_default(),
        stdout: record.stdout.clone().unwrap_or_default(),
        stderr: record.stderr.clone().unwrap_or_default(),
        execution_time: record.execution_time,
        error: record.error.clone(),
    }
}
