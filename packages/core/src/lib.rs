//! Core domain types for the job broker.
//!
//! This crate contains shared types used across all packages:
//! - JobRecord and JobStatus for the persisted job lifecycle
//! - QueueConfig for the broker topology of each job class
//! - Job requests and their wire envelope
//! - JobMetadata for fan-out sets mirrored in object storage
//! - Events for lifecycle observers

mod events;
mod job;
mod metadata;
mod queue;
mod request;

pub use events::JobEvent;
pub use job::{ExecutionTime, JobId, JobOutcome, JobRecord, JobStatus, JobType, StatusUpdate};
pub use metadata::{JobMetadata, JobMetadataPatch, MetadataFinalized, MetadataStatus};
pub use queue::{DeadLetterConfig, ExchangeConfig, ExchangeKind, QueueConfig};
pub use request::{
    EXECUTABLES, Executable, ExecutionTask, JobMessage, JobRequest, QuantifyRequest, SequenceJob,
    ValidationError,
};
