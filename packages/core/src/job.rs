//! Job record types for the persisted job lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
///
/// The same identifier correlates the broker message, the record store
/// document and any object-store blobs belonging to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job class; each class has its own queue topology and handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Quantification,
    Executable,
    DistributedSequenceChild,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::Quantification,
        JobType::Executable,
        JobType::DistributedSequenceChild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Quantification => "quantification",
            JobType::Executable => "executable",
            JobType::DistributedSequenceChild => "distributed-sequence-child",
        }
    }

    /// Parse the kebab-case name used on the wire and in configuration.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "quantification" => Some(JobType::Quantification),
            "executable" => Some(JobType::Executable),
            "distributed-sequence-child" => Some(JobType::DistributedSequenceChild),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of a job in its lifecycle.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job record exists; its message is waiting in the queue.
    #[default]
    Pending,
    /// A worker dequeued the message and is executing the job.
    Running,
    /// The engine ran and reported success.
    Completed,
    /// The engine ran (or could not be started) and reported failure.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects the lifecycle order.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Statuses a record may be in for `next` to be applied.
    pub fn predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[],
            JobStatus::Running => &[JobStatus::Pending],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Running],
        }
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock breakdown of a job execution, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionTime {
    /// Staging inputs (decoding models, writing temp files).
    pub prepare_ms: u64,
    /// Time spent waiting on the engine process.
    pub engine_ms: u64,
    /// Collecting outputs after the engine exited.
    pub collect_ms: u64,
    pub total_ms: u64,
}

/// Captured result of running a job; execution failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// `Completed` or `Failed`.
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<String>,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<ExecutionTime>,
    /// Set when the engine could not be run at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    /// Build an outcome whose status is driven by the exit code.
    pub fn from_exit(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let status = if exit_code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        Self {
            status,
            results: Vec::new(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            execution_time: None,
            error: None,
        }
    }

    /// An outcome for an invocation that never produced an exit code.
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: JobStatus::Failed,
            results: Vec::new(),
            exit_code: 1,
            stdout: String::new(),
            stderr: error.clone(),
            execution_time: None,
            error: Some(error),
        }
    }

    pub fn with_results(mut self, results: Vec<String>) -> Self {
        self.results = results;
        self
    }

    pub fn with_execution_time(mut self, execution_time: ExecutionTime) -> Self {
        self.execution_time = Some(execution_time);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// A status write against the record store.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// `pending -> running`, claimed by the named worker.
    Running { worker_id: String },
    /// `running -> completed | failed` with the captured output.
    Finished(JobOutcome),
}

impl StatusUpdate {
    /// Status the record ends up in once the update is applied.
    pub fn target(&self) -> JobStatus {
        match self {
            StatusUpdate::Running { .. } => JobStatus::Running,
            StatusUpdate::Finished(outcome) => outcome.status,
        }
    }
}

/// The persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Quantification configuration or executable task, as submitted.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<ExecutionTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a new pending record.
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Pending,
            payload,
            results: Vec::new(),
            exit_code: None,
            stdout: None,
            stderr: None,
            execution_time: None,
            worker_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status update in memory, refusing out-of-order transitions.
    ///
    /// Returns `false` (leaving the record untouched) when the update would
    /// regress or skip a state.
    pub fn apply(&mut self, update: &StatusUpdate) -> bool {
        let target = update.target();
        if !self.status.can_transition_to(target) {
            return false;
        }
        match update {
            StatusUpdate::Running { worker_id } => {
                self.worker_id = Some(worker_id.clone());
            }
            StatusUpdate::Finished(outcome) => {
                self.results = outcome.results.clone();
                self.exit_code = Some(outcome.exit_code);
                self.stdout = Some(outcome.stdout.clone());
                self.stderr = Some(outcome.stderr.clone());
                self.execution_time = outcome.execution_time;
                self.error = outcome.error.clone();
            }
        }
        self.status = target;
        self.updated_at = Utc::now();
        true
    }
}
