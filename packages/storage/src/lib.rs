//! Object storage for job inputs, outputs, metadata and completion markers.
//!
//! [`Storage`] is a thin wrapper around `object_store` (S3-compatible in
//! production, on-disk for local runs, in-memory for tests). [`JobStorage`]
//! lays the broker's blobs out in three areas on top of it, and
//! [`CompletionTracker`] counts finished fan-out children without a shared
//! counter.

mod completion;
mod config;
mod jobs;
mod store;

pub use completion::{CompletionTracker, TrackerError};
pub use config::{S3Config, StorageAreas, StorageBackendConfig, StorageConfig, StorageKind};
pub use jobs::{CleanupReport, JobStorage};
pub use store::{ObjectInfo, Storage};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Finalized(#[from] broker_core::MetadataFinalized),
}
