//! Job blobs laid out over the input, output and jobs areas.
//!
//! Key layout inside each area:
//!
//! - `input-{inputId}-{timestampMs}.json`
//! - `output-{outputId}-{timestampMs}.json`
//! - `job-{jobId}.json`
//! - `job-{parentId}/completed/{childId}.marker` (see [`crate::CompletionTracker`])
//! - `job-{parentId}/results/{childId}.json`

use std::sync::Arc;
use std::time::Duration;

use broker_core::{JobMetadata, JobMetadataPatch};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::{ObjectInfo, Storage, StorageAreas, StorageError};

/// Objects removed by one [`JobStorage::cleanup_old_files`] sweep, per area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub input: usize,
    pub output: usize,
    pub jobs: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.input + self.output + self.jobs
    }
}

#[derive(Clone)]
pub struct JobStorage {
    storage: Storage,
    areas: StorageAreas,
    /// Serializes metadata read-merge-write cycles of this process.
    metadata_writes: Arc<Mutex<()>>,
}

impl JobStorage {
    pub fn new(storage: Storage, areas: StorageAreas) -> Result<Self, StorageError> {
        areas.validate()?;
        Ok(Self {
            storage,
            areas,
            metadata_writes: Arc::new(Mutex::new(())),
        })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(Storage::from_env().await?, StorageAreas::from_env()?)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn areas(&self) -> &StorageAreas {
        &self.areas
    }

    /// Key of `name` inside the jobs area.
    pub(crate) fn jobs_key(&self, name: &str) -> String {
        format!("{}/{}", self.areas.jobs, name)
    }

    fn metadata_key(&self, job_id: &str) -> String {
        self.jobs_key(&format!("job-{job_id}.json"))
    }

    /// Objects in `area` whose file name starts with `{kind}-{id}-`, newest first.
    async fn find_by_id(
        &self,
        area: &str,
        kind: &str,
        id: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        check_id(id)?;
        let needle = format!("{kind}-{id}-");
        let mut matches: Vec<ObjectInfo> = self
            .storage
            .list(area)
            .await?
            .into_iter()
            .filter(|info| info.file_name().starts_with(&needle))
            .collect();
        matches.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(matches)
    }

    async fn store_blob(&self, area: &str, kind: &str, data: &str) -> Result<String, StorageError> {
        let id = Ulid::new().to_string();
        let key = format!("{area}/{kind}-{id}-{}.json", Utc::now().timestamp_millis());
        self.storage
            .put_bytes(&key, Bytes::from(data.to_owned()))
            .await?;
        Ok(id)
    }

    async fn get_blob(&self, area: &str, kind: &str, id: &str) -> Result<String, StorageError> {
        let newest = self
            .find_by_id(area, kind, id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(format!("{kind} data for id {id}")))?;
        let bytes = self.storage.get_bytes(&newest.key).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::InvalidKey(format!("{}: not utf-8: {e}", newest.key)))
    }

    async fn delete_blobs(&self, area: &str, kind: &str, id: &str) -> Result<usize, StorageError> {
        let found = self.find_by_id(area, kind, id).await?;
        for info in &found {
            self.storage.delete(&info.key).await?;
        }
        Ok(found.len())
    }

    /// Store a job input document and return its generated input id.
    pub async fn store_input_data(&self, data: &str) -> Result<String, StorageError> {
        let input_id = self.store_blob(&self.areas.input, "input", data).await?;
        tracing::info!(input_id = %input_id, "Stored input data");
        Ok(input_id)
    }

    pub async fn get_input_data(&self, input_id: &str) -> Result<String, StorageError> {
        self.get_blob(&self.areas.input, "input", input_id).await
    }

    /// Remove every object stored under `input_id`; returns how many were removed.
    pub async fn delete_input_data(&self, input_id: &str) -> Result<usize, StorageError> {
        let removed = self.delete_blobs(&self.areas.input, "input", input_id).await?;
        tracing::info!(input_id = %input_id, removed, "Deleted input data");
        Ok(removed)
    }

    /// Store an output document produced from `input_id`; returns the output id.
    pub async fn store_output_data(
        &self,
        data: &str,
        input_id: &str,
    ) -> Result<String, StorageError> {
        let output_id = self.store_blob(&self.areas.output, "output", data).await?;
        tracing::info!(output_id = %output_id, input_id = %input_id, "Stored output data");
        Ok(output_id)
    }

    pub async fn get_output_data(&self, output_id: &str) -> Result<String, StorageError> {
        self.get_blob(&self.areas.output, "output", output_id).await
    }

    pub async fn delete_output_data(&self, output_id: &str) -> Result<usize, StorageError> {
        let removed = self
            .delete_blobs(&self.areas.output, "output", output_id)
            .await?;
        tracing::info!(output_id = %output_id, removed, "Deleted output data");
        Ok(removed)
    }

    pub async fn create_job_metadata(&self, metadata: &JobMetadata) -> Result<(), StorageError> {
        check_id(&metadata.job_id)?;
        self.storage
            .put_json(&self.metadata_key(&metadata.job_id), metadata)
            .await?;
        tracing::info!(job_id = %metadata.job_id, "Created job metadata");
        Ok(())
    }

    /// Read, merge and write back the metadata document.
    ///
    /// Fails with [`StorageError::Finalized`] once the document is completed
    /// or failed. Writers in other processes are not serialized, so
    /// concurrent children must not use this to count completions.
    pub async fn update_job_metadata(
        &self,
        job_id: &str,
        patch: JobMetadataPatch,
    ) -> Result<JobMetadata, StorageError> {
        let _guard = self.metadata_writes.lock().await;
        let mut metadata = self.get_job_metadata(job_id).await?;
        metadata.apply(patch)?;
        self.storage
            .put_json(&self.metadata_key(job_id), &metadata)
            .await?;
        tracing::debug!(job_id = %job_id, status = ?metadata.status, "Updated job metadata");
        Ok(metadata)
    }

    pub async fn get_job_metadata(&self, job_id: &str) -> Result<JobMetadata, StorageError> {
        check_id(job_id)?;
        self.storage.get_json(&self.metadata_key(job_id)).await
    }

    /// Every `job-*.json` document in the jobs area; unreadable ones are skipped.
    pub async fn get_all_job_metadata(&self) -> Result<Vec<JobMetadata>, StorageError> {
        let area_prefix = format!("{}/", self.areas.jobs);
        let mut all = Vec::new();

        for info in self.storage.list(&self.areas.jobs).await? {
            let Some(name) = info.key.strip_prefix(&area_prefix) else {
                continue;
            };
            if name.contains('/') || !name.starts_with("job-") || !name.ends_with(".json") {
                continue;
            }
            match self.storage.get_json::<JobMetadata>(&info.key).await {
                Ok(metadata) => all.push(metadata),
                Err(e) => {
                    tracing::warn!(key = %info.key, error = %e, "Skipping unreadable job metadata");
                }
            }
        }

        Ok(all)
    }

    /// Store the result document of one fan-out child under its parent.
    pub async fn put_child_result<T: Serialize>(
        &self,
        parent_id: &str,
        child_id: &str,
        result: &T,
    ) -> Result<(), StorageError> {
        check_id(parent_id)?;
        check_id(child_id)?;
        let key = self.jobs_key(&format!("job-{parent_id}/results/{child_id}.json"));
        self.storage.put_json(&key, result).await
    }

    /// Every child result stored under `parent_id`, sorted by child id.
    pub async fn child_results<T: DeserializeOwned>(
        &self,
        parent_id: &str,
    ) -> Result<Vec<(String, T)>, StorageError> {
        check_id(parent_id)?;
        let prefix = self.jobs_key(&format!("job-{parent_id}/results"));
        let mut results = Vec::new();
        for info in self.storage.list(&prefix).await? {
            let Some(child_id) = info.file_name().strip_suffix(".json") else {
                continue;
            };
            let child_id = child_id.to_string();
            results.push((child_id, self.storage.get_json::<T>(&info.key).await?));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Delete objects in all three areas last modified more than `max_age` ago.
    pub async fn cleanup_old_files(&self, max_age: Duration) -> Result<CleanupReport, StorageError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| StorageError::InvalidConfig(format!("cleanup age out of range: {e}")))?;
        let cutoff = Utc::now() - max_age;

        let report = CleanupReport {
            input: self.cleanup_area(&self.areas.input, cutoff).await?,
            output: self.cleanup_area(&self.areas.output, cutoff).await?,
            jobs: self.cleanup_area(&self.areas.jobs, cutoff).await?,
        };

        tracing::info!(
            input = report.input,
            output = report.output,
            jobs = report.jobs,
            "Storage cleanup completed"
        );
        Ok(report)
    }

    async fn cleanup_area(
        &self,
        area: &str,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let stale: Vec<ObjectInfo> = self
            .storage
            .list(area)
            .await?
            .into_iter()
            .filter(|info| info.last_modified < cutoff)
            .collect();
        for info in &stale {
            self.storage.delete(&info.key).await?;
        }
        Ok(stale.len())
    }

    pub async fn is_healthy(&self) -> bool {
        match self.storage.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Object storage health check failed");
                false
            }
        }
    }
}

fn check_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id.contains('/') {
        return Err(StorageError::InvalidKey(format!("invalid id {id:?}")));
    }
    Ok(())
}
