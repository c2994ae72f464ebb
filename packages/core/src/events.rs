//! Lifecycle events for observers of the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobType};

/// Events emitted by producers and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job record was created and its message published.
    JobEnqueued {
        job_id: JobId,
        job_type: JobType,
        timestamp: DateTime<Utc>,
    },
    /// A worker claimed the job and marked it running.
    JobStarted {
        job_id: JobId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The engine reported success and the result was recorded.
    JobCompleted {
        job_id: JobId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The engine reported failure and the result was recorded.
    JobFailed {
        job_id: JobId,
        exit_code: i32,
        timestamp: DateTime<Utc>,
    },
    /// A message was rejected without requeue and routed to the dead-letter queue.
    MessageDeadLettered {
        queue: String,
        job_id: Option<JobId>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A child of a fan-out set wrote its completion marker.
    ChildCompleted {
        parent_job_id: JobId,
        sequence_id: String,
        completed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },
    /// Every child of a fan-out set has finished.
    FanInCompleted {
        parent_job_id: JobId,
        output_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::MessageDeadLettered { timestamp, .. } => *timestamp,
            JobEvent::ChildCompleted { timestamp, .. } => *timestamp,
            JobEvent::FanInCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job_id, .. } => Some(*job_id),
            JobEvent::JobStarted { job_id, .. } => Some(*job_id),
            JobEvent::JobCompleted { job_id, .. } => Some(*job_id),
            JobEvent::JobFailed { job_id, .. } => Some(*job_id),
            JobEvent::MessageDeadLettered { job_id, .. } => *job_id,
            JobEvent::ChildCompleted { parent_job_id, .. } => Some(*parent_job_id),
            JobEvent::FanInCompleted { parent_job_id, .. } => Some(*parent_job_id),
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued {
                job_id, job_type, ..
            } => format!("Job {} ({}) enqueued", job_id, job_type),
            JobEvent::JobStarted {
                job_id, worker_id, ..
            } => format!("Job {} started by {}", job_id, worker_id),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed {
                job_id, exit_code, ..
            } => format!("Job {} failed with exit code {}", job_id, exit_code),
            JobEvent::MessageDeadLettered { queue, reason, .. } => {
                format!("Message on {} dead-lettered: {}", queue, reason)
            }
            JobEvent::ChildCompleted {
                parent_job_id,
                completed,
                total,
                ..
            } => format!("Job {}: {}/{} children finished", parent_job_id, completed, total),
            JobEvent::FanInCompleted { parent_job_id, .. } => {
                format!("Job {}: all children finished", parent_job_id)
            }
        }
    }
}
