//! Race-free completion counting for fan-out children.
//!
//! Each finished child writes its own marker object under
//! `job-{parentId}/completed/` in the jobs area. Completion is the number of
//! distinct markers found by listing, so concurrent workers never contend
//! on a shared document.

use broker_core::JobId;
use bytes::Bytes;

use crate::{JobStorage, StorageError};

const MARKER_SUFFIX: &str = ".marker";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("invalid child id {0:?}")]
    InvalidChildId(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone)]
pub struct CompletionTracker {
    jobs: JobStorage,
}

impl CompletionTracker {
    pub fn new(jobs: JobStorage) -> Self {
        Self { jobs }
    }

    fn completed_prefix(&self, parent: JobId) -> String {
        self.jobs.jobs_key(&format!("job-{parent}/completed"))
    }

    /// Record that `child` finished. Repeating the call for the same child
    /// overwrites the same key and does not change the count.
    pub async fn mark_completed(&self, parent: JobId, child: &str) -> Result<(), TrackerError> {
        if child.is_empty() || child.contains('/') {
            return Err(TrackerError::InvalidChildId(child.to_string()));
        }
        let key = format!("{}/{child}{MARKER_SUFFIX}", self.completed_prefix(parent));
        self.jobs
            .storage()
            .put_bytes(&key, Bytes::from_static(b"1"))
            .await?;
        tracing::debug!(parent_job_id = %parent, child = %child, "Marked child completed");
        Ok(())
    }

    pub async fn count_completed(&self, parent: JobId) -> Result<usize, TrackerError> {
        Ok(self.list_completed(parent).await?.len())
    }

    /// Child ids with a marker, sorted.
    pub async fn list_completed(&self, parent: JobId) -> Result<Vec<String>, TrackerError> {
        let listed = self
            .jobs
            .storage()
            .list(&self.completed_prefix(parent))
            .await?;
        let mut children: Vec<String> = listed
            .iter()
            .filter_map(|info| info.file_name().strip_suffix(MARKER_SUFFIX))
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }
}
