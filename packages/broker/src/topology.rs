//! Resolve the queue topology of each job class from configuration.
//!
//! Every job class reads the same set of keys under its own prefix, e.g.
//! `MQ_QUANT_JOB_QUEUE_ID`. Every key is required: a missing value fails
//! startup instead of falling back to a default.

use std::collections::HashMap;

use broker_core::{DeadLetterConfig, ExchangeConfig, ExchangeKind, JobType, QueueConfig};

use crate::config::{ConfigError, ConfigSource, parse_bool, parse_required};

/// Key prefix of a job class.
pub fn class_prefix(job_type: JobType) -> &'static str {
    match job_type {
        JobType::Quantification => "QUANT_JOB",
        JobType::Executable => "EXEC_TASK",
        JobType::DistributedSequenceChild => "DIST_SEQ",
    }
}

/// Builds [`QueueConfig`]s without touching the broker.
pub struct QueueTopologyFactory<S> {
    source: S,
}

impl<S: ConfigSource> QueueTopologyFactory<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn quantification(&self) -> Result<QueueConfig, ConfigError> {
        self.for_job_type(JobType::Quantification)
    }

    pub fn executable(&self) -> Result<QueueConfig, ConfigError> {
        self.for_job_type(JobType::Executable)
    }

    pub fn distributed_sequence(&self) -> Result<QueueConfig, ConfigError> {
        self.for_job_type(JobType::DistributedSequenceChild)
    }

    /// Topologies for the given job classes.
    pub fn for_job_types(
        &self,
        job_types: &[JobType],
    ) -> Result<HashMap<JobType, QueueConfig>, ConfigError> {
        job_types
            .iter()
            .map(|job_type| Ok((*job_type, self.for_job_type(*job_type)?)))
            .collect()
    }

    pub fn all(&self) -> Result<HashMap<JobType, QueueConfig>, ConfigError> {
        self.for_job_types(&JobType::ALL)
    }

    pub fn for_job_type(&self, job_type: JobType) -> Result<QueueConfig, ConfigError> {
        let key = |suffix: &str| format!("MQ_{}_{suffix}", class_prefix(job_type));
        let src = &self.source;

        let name = src.required(&key("QUEUE_ID"))?;
        let dead_letter_name = src.required(&key("DEAD_LETTER_QUEUE_ID"))?;
        if dead_letter_name == name {
            return Err(ConfigError::Invalid {
                key: key("DEAD_LETTER_QUEUE_ID"),
                value: dead_letter_name,
                reason: "must differ from the primary queue".to_string(),
            });
        }

        let exchange = ExchangeConfig {
            name: src.required(&key("EXCHANGE_ID"))?,
            kind: exchange_kind(src, &key("EXCHANGE_TYPE"))?,
            durable: parse_bool(src, &key("EXCHANGE_DURABLE"))?,
            binding_key: src.required(&key("BINDING_KEY"))?,
            routing_key: src.required(&key("ROUTING_KEY"))?,
        };

        // The routing key is what the primary queue stamps on rejected
        // messages; the binding key attaches the dead-letter queue.
        let dead_letter = DeadLetterConfig {
            name: dead_letter_name,
            exchange: ExchangeConfig {
                name: src.required(&key("DEAD_LETTER_EXCHANGE_ID"))?,
                kind: exchange_kind(src, &key("DEAD_LETTER_EXCHANGE_TYPE"))?,
                durable: parse_bool(src, &key("DEAD_LETTER_EXCHANGE_DURABLE"))?,
                binding_key: src.required(&key("DEAD_LETTER_BINDING_KEY"))?,
                routing_key: src.required(&key("DEAD_LETTER_ROUTING_KEY"))?,
            },
            durable: parse_bool(src, &key("DEAD_LETTER_QUEUE_DURABLE"))?,
        };

        Ok(QueueConfig {
            name,
            durable: parse_bool(src, &key("QUEUE_DURABLE"))?,
            message_ttl: parse_required(src, &key("MSG_TTL"))?,
            max_length: parse_required(src, &key("QUEUE_MAXLENGTH"))?,
            prefetch: parse_required(src, &key("MSG_PREFETCH_COUNT"))?,
            exchange,
            dead_letter,
        })
    }
}

fn exchange_kind(source: &impl ConfigSource, key: &str) -> Result<ExchangeKind, ConfigError> {
    let value = source.required(key)?;
    ExchangeKind::parse(&value).ok_or_else(|| ConfigError::Invalid {
        key: key.to_string(),
        value,
        reason: "expected direct, fanout, topic or headers".to_string(),
    })
}
