//! Job submission: validate, persist as pending, publish.

use std::collections::HashMap;
use std::sync::Arc;

use broker_core::{
    JobEvent, JobId, JobMetadata, JobMetadataPatch, JobRecord, JobRequest, JobType, MetadataStatus,
    QueueConfig, QuantifyRequest, SequenceJob, ValidationError,
};
use chrono::Utc;
use db::DbError;
use db::repositories::JobRepository;
use storage::{JobStorage, StorageError};
use tokio::sync::broadcast;

use crate::connection::{ConnectionError, ConnectionManager};
use crate::provisioner::{ProvisionError, QueueProvisioner};
use crate::transport::{BrokerError, MessageChannel};

/// Service name of the producer's connection.
pub const PRODUCER_SERVICE: &str = "producer";

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("invalid job request: {0}")]
    Validation(#[from] ValidationError),

    #[error("no queue configured for {0} jobs")]
    UnknownJobClass(JobType),

    #[error("failed to create job record: {0}")]
    Store(#[from] DbError),

    #[error("job {job_id} was recorded but its message could not be published")]
    Publish {
        job_id: JobId,
        #[source]
        source: BrokerError,
    },

    #[error("fan-out requires object storage")]
    StorageUnavailable,

    #[error("object storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("failed to encode input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A parent job fanned out into one child per sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutJob {
    pub parent_job_id: JobId,
    pub input_id: String,
    /// Child record ids, in sequence order.
    pub child_job_ids: Vec<JobId>,
}

/// Publishes jobs to the primary exchange of their class.
pub struct Producer {
    channel: Arc<dyn MessageChannel>,
    repository: Arc<dyn JobRepository>,
    topology: HashMap<JobType, QueueConfig>,
    storage: Option<JobStorage>,
    events: Option<broadcast::Sender<JobEvent>>,
}

impl Producer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        repository: Arc<dyn JobRepository>,
        topology: HashMap<JobType, QueueConfig>,
    ) -> Self {
        Self {
            channel,
            repository,
            topology,
            storage: None,
            events: None,
        }
    }

    /// Build a producer on the manager's `producer` channel.
    pub async fn connect(
        manager: &ConnectionManager,
        repository: Arc<dyn JobRepository>,
        topology: HashMap<JobType, QueueConfig>,
    ) -> Result<Self, ProducerError> {
        let channel = manager.get_channel(PRODUCER_SERVICE).await?;
        Ok(Self::new(channel, repository, topology))
    }

    pub fn with_storage(mut self, storage: JobStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Declare the topology of every configured job class.
    pub async fn provision(&self) -> Result<(), ProducerError> {
        for job_type in JobType::ALL {
            if let Some(config) = self.topology.get(&job_type) {
                QueueProvisioner
                    .setup_queue(config, self.channel.as_ref())
                    .await?;
            }
        }
        Ok(())
    }

    /// Submit a job and return its id.
    ///
    /// Nothing is written when validation fails. When publishing fails the
    /// record stays `pending` and the error is returned; there is no retry.
    pub async fn enqueue(&self, request: JobRequest) -> Result<JobId, ProducerError> {
        request.validate()?;
        let job_type = request.job_type();
        let config = self
            .topology
            .get(&job_type)
            .ok_or(ProducerError::UnknownJobClass(job_type))?;

        let record = JobRecord::new(job_type, request.to_value()?);
        let job_id = record.id;
        let body = request.encode(job_id)?;

        self.repository.create(&record).await?;

        let exchange = &config.exchange;
        if let Err(source) = self
            .channel
            .publish(&exchange.name, &exchange.routing_key, &body)
            .await
        {
            tracing::error!(
                alert = "pending_without_message",
                job_id = %job_id,
                exchange = %exchange.name,
                error = %source,
                "Job recorded as pending but its message was not published"
            );
            return Err(ProducerError::Publish { job_id, source });
        }

        tracing::info!(job_id = %job_id, job_type = %job_type, queue = %config.name, "Job enqueued");
        if let Some(tx) = &self.events {
            let _ = tx.send(JobEvent::JobEnqueued {
                job_id,
                job_type,
                timestamp: Utc::now(),
            });
        }
        Ok(job_id)
    }

    /// Split `request` into one child job per sequence of `event_tree`.
    ///
    /// The parent's input and metadata are stored first; children complete
    /// the parent through the completion tracker.
    pub async fn enqueue_fan_out(
        &self,
        request: QuantifyRequest,
        event_tree: &str,
        sequences: &[String],
    ) -> Result<FanOutJob, ProducerError> {
        request.validate()?;
        if sequences.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "sequences".to_string(),
                reason: "at least one sequence is required".to_string(),
            }
            .into());
        }
        let storage = self
            .storage
            .as_ref()
            .ok_or(ProducerError::StorageUnavailable)?;

        let parent_job_id = JobId::new();
        let children: Vec<SequenceJob> = sequences
            .iter()
            .map(|sequence| SequenceJob::new(parent_job_id, event_tree, sequence.as_str(), request.clone()))
            .collect();
        for child in &children {
            child.validate()?;
        }

        let input_id = storage
            .store_input_data(&serde_json::to_string(&request)?)
            .await?;
        let parent_id = parent_job_id.to_string();
        let metadata = JobMetadata::new(&parent_id, &input_id)
            .with_child_jobs(children.iter().map(|c| c.sequence_id.clone()).collect());
        storage.create_job_metadata(&metadata).await?;

        let mut child_job_ids = Vec::with_capacity(children.len());
        for child in children {
            let sequence_id = child.sequence_id.clone();
            match self.enqueue(JobRequest::Sequence(child)).await {
                Ok(job_id) => child_job_ids.push(job_id),
                Err(e) => {
                    let mut patch = JobMetadataPatch::status(MetadataStatus::Failed);
                    patch.error = Some(format!("failed to enqueue {sequence_id}: {e}"));
                    if let Err(update) = storage.update_job_metadata(&parent_id, patch).await {
                        tracing::warn!(parent_job_id = %parent_job_id, error = %update, "Could not mark fan-out failed");
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            parent_job_id = %parent_job_id,
            children = child_job_ids.len(),
            "Fan-out enqueued"
        );
        Ok(FanOutJob {
            parent_job_id,
            input_id,
            child_job_ids,
        })
    }
}
