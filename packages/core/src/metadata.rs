//! Fan-out job metadata mirrored in object storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a fan-out parent as seen by pollers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Pending => "pending",
            MetadataStatus::Running => "running",
            MetadataStatus::Completed => "completed",
            MetadataStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MetadataStatus::Completed | MetadataStatus::Failed)
    }
}

/// A patch was applied to metadata that already reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id} metadata is already {}", status.as_str())]
pub struct MetadataFinalized {
    pub job_id: String,
    pub status: MetadataStatus,
}

/// `job-{jobId}.json` in the jobs area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    #[serde(default)]
    pub child_jobs: Vec<String>,
    #[serde(default)]
    pub status: MetadataStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobMetadata {
    pub fn new(job_id: impl Into<String>, input_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            input_id: Some(input_id.into()),
            output_id: None,
            child_jobs: Vec::new(),
            status: MetadataStatus::Pending,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_child_jobs(mut self, child_jobs: Vec<String>) -> Self {
        self.child_jobs = child_jobs;
        self
    }

    /// Shallow-merge the populated fields of `patch` and refresh the timestamp.
    ///
    /// Completed and failed documents are final and reject every patch.
    pub fn apply(&mut self, patch: JobMetadataPatch) -> Result<(), MetadataFinalized> {
        if self.status.is_terminal() {
            return Err(MetadataFinalized {
                job_id: self.job_id.clone(),
                status: self.status,
            });
        }
        if let Some(output_id) = patch.output_id {
            self.output_id = Some(output_id);
        }
        if let Some(child_jobs) = patch.child_jobs {
            self.child_jobs = child_jobs;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        self.timestamp = Utc::now();
        Ok(())
    }
}

/// Partial update for [`JobMetadata`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMetadataPatch {
    pub output_id: Option<String>,
    pub child_jobs: Option<Vec<String>>,
    pub status: Option<MetadataStatus>,
    pub error: Option<String>,
}

impl JobMetadataPatch {
    pub fn status(status: MetadataStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_output_id(mut self, output_id: impl Into<String>) -> Self {
        self.output_id = Some(output_id.into());
        self
    }
}
