//! Job repository: create, lookup and monotonic status updates.

use std::future::Future;
use std::pin::Pin;

use broker_core::{
    ExecutionTime, JobId, JobOutcome, JobRecord, JobStatus, JobType, StatusUpdate,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// Future type returned by [`JobRepository`] methods.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// Narrow persistence contract for job records.
///
/// Implementations must apply [`JobRepository::update_status`] as a single
/// conditional write so that two workers racing on the same job cannot both
/// move it forward.
pub trait JobRepository: Send + Sync + 'static {
    /// Insert a new record; fails with [`DbError::AlreadyExists`] on an id clash.
    fn create<'a>(&'a self, record: &'a JobRecord) -> RepoFuture<'a, JobRecord>;

    /// Look up a record by id.
    fn find_by_id(&self, id: JobId) -> RepoFuture<'_, Option<JobRecord>>;

    /// Move a record forward in its lifecycle.
    ///
    /// Returns [`DbError::InvalidTransition`] when the stored status is not a
    /// predecessor of the requested one, and [`DbError::NotFound`] when no
    /// record exists.
    fn update_status<'a>(
        &'a self,
        id: JobId,
        update: &'a StatusUpdate,
    ) -> RepoFuture<'a, JobRecord>;
}

/// Stored shape of a job; timestamps and the payload are kept as strings so
/// the document round-trips without engine-specific types.
#[derive(Debug, Serialize, Deserialize)]
struct JobDocument {
    job_id: String,
    job_type: String,
    status: String,
    payload: String,
    #[serde(default)]
    results: Vec<String>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    execution_time: Option<ExecutionTime>,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobDocument {
    fn from_record(record: &JobRecord) -> Result<Self, DbError> {
        Ok(Self {
            job_id: record.id.to_string(),
            job_type: record.job_type.as_str().to_string(),
            status: record.status.as_str().to_string(),
            payload: serde_json::to_string(&record.payload)
                .map_err(|e| DbError::Serialization(e.to_string()))?,
            results: record.results.clone(),
            exit_code: record.exit_code,
            stdout: record.stdout.clone(),
            stderr: record.stderr.clone(),
            execution_time: record.execution_time,
            worker_id: record.worker_id.clone(),
            error: record.error.clone(),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        })
    }

    fn into_record(self) -> Result<JobRecord, DbError> {
        let id = JobId::parse(&self.job_id)
            .map_err(|e| DbError::Serialization(format!("job_id {}: {}", self.job_id, e)))?;
        let job_type = JobType::parse(&self.job_type)
            .ok_or_else(|| DbError::Serialization(format!("unknown job_type {}", self.job_type)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| DbError::Serialization(format!("unknown status {}", self.status)))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        Ok(JobRecord {
            id,
            job_type,
            status,
            payload,
            results: self.results,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            execution_time: self.execution_time,
            worker_id: self.worker_id,
            error: self.error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DbError::Serialization(format!("timestamp {}: {}", raw, e)))
}

/// Fields merged into the stored document by a status update.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum StatusPatch {
    Running {
        status: String,
        worker_id: String,
        updated_at: String,
    },
    Finished {
        status: String,
        results: Vec<String>,
        exit_code: i32,
        stdout: String,
        stderr: String,
        execution_time: Option<ExecutionTime>,
        error: Option<String>,
        updated_at: String,
    },
}

impl StatusPatch {
    fn from_update(update: &StatusUpdate) -> Self {
        let updated_at = Utc::now().to_rfc3339();
        match update {
            StatusUpdate::Running { worker_id } => StatusPatch::Running {
                status: JobStatus::Running.as_str().to_string(),
                worker_id: worker_id.clone(),
                updated_at,
            },
            StatusUpdate::Finished(outcome) => Self::finished(outcome, updated_at),
        }
    }

    fn finished(outcome: &JobOutcome, updated_at: String) -> Self {
        StatusPatch::Finished {
            status: outcome.status.as_str().to_string(),
            results: outcome.results.clone(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            execution_time: outcome.execution_time,
            error: outcome.error.clone(),
            updated_at,
        }
    }
}

const CONDITIONAL_UPDATE: &str = "UPDATE type::thing('job', $id) MERGE $patch \
     WHERE status IN $from RETURN AFTER";

/// [`JobRepository`] backed by a SurrealDB `job` table.
#[derive(Clone)]
pub struct SurrealJobRepository {
    db: Database,
}

impl SurrealJobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Access the underlying connection.
    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn create_record(&self, record: &JobRecord) -> Result<JobRecord, DbError> {
        let document = JobDocument::from_record(record)?;
        let created: Result<Option<JobDocument>, surrealdb::Error> = self
            .db
            .create(("job", record.id.to_string()))
            .content(document)
            .await;

        match created {
            Ok(Some(document)) => document.into_record(),
            Ok(None) => Err(DbError::Query(format!("Failed to create job {}", record.id))),
            Err(err) => {
                if self.find_record(record.id).await?.is_some() {
                    Err(DbError::AlreadyExists { id: record.id })
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn find_record(&self, id: JobId) -> Result<Option<JobRecord>, DbError> {
        let document: Option<JobDocument> = self.db.select(("job", id.to_string())).await?;
        document.map(JobDocument::into_record).transpose()
    }

    async fn update_record(
        &self,
        id: JobId,
        update: &StatusUpdate,
    ) -> Result<JobRecord, DbError> {
        let requested = update.target();
        let from: Vec<String> = JobStatus::predecessors(requested)
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();

        let mut response = self
            .db
            .query(CONDITIONAL_UPDATE)
            .bind(("id", id.to_string()))
            .bind(("patch", StatusPatch::from_update(update)))
            .bind(("from", from))
            .await?;
        let updated: Vec<JobDocument> = response.take(0)?;

        if let Some(document) = updated.into_iter().next() {
            tracing::debug!(job_id = %id, status = %requested, "Job status updated");
            return document.into_record();
        }

        match self.find_record(id).await? {
            Some(current) => Err(DbError::InvalidTransition {
                id,
                current: current.status,
                requested,
            }),
            None => Err(DbError::NotFound(id)),
        }
    }
}

impl JobRepository for SurrealJobRepository {
    fn create<'a>(&'a self, record: &'a JobRecord) -> RepoFuture<'a, JobRecord> {
        Box::pin(self.create_record(record))
    }

    fn find_by_id(&self, id: JobId) -> RepoFuture<'_, Option<JobRecord>> {
        Box::pin(self.find_record(id))
    }

    fn update_status<'a>(
        &'a self,
        id: JobId,
        update: &'a StatusUpdate,
    ) -> RepoFuture<'a, JobRecord> {
        Box::pin(self.update_record(id, update))
    }
}
