//! Process settings read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use broker::broker_core::JobType;
use broker::{CleanupSettings, ConfigError, ConfigSource, ConnectionSettings, parse_opt, parse_or};

/// Broker URL scheme served by the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub connection: ConnectionSettings,
    /// Consumers per job class.
    pub concurrency: usize,
    /// Job classes this process consumes, in startup order.
    pub job_classes: Vec<JobType>,
    pub engine_bin_dir: Option<PathBuf>,
    pub engine_timeout: Option<Duration>,
    pub cleanup: CleanupSettings,
}

impl Settings {
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        let concurrency: usize = parse_or(source, "WORKER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY".to_string(),
                value: "0".to_string(),
                reason: "at least one consumer is required".to_string(),
            });
        }

        Ok(Self {
            connection: ConnectionSettings::from_source(source)?,
            concurrency,
            job_classes: job_classes(source)?,
            engine_bin_dir: source.get("ENGINE_BIN_DIR").map(PathBuf::from),
            engine_timeout: parse_opt::<u64>(source, "ENGINE_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            cleanup: CleanupSettings::from_source(source)?,
        })
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.connection.url.starts_with(MEMORY_SCHEME)
    }
}

fn job_classes(source: &impl ConfigSource) -> Result<Vec<JobType>, ConfigError> {
    let Some(value) = source.get("WORKER_JOB_CLASSES") else {
        return Ok(JobType::ALL.to_vec());
    };

    let mut classes = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let job_type = JobType::parse(name).ok_or_else(|| ConfigError::Invalid {
            key: "WORKER_JOB_CLASSES".to_string(),
            value: value.clone(),
            reason: format!("unknown job class {name}"),
        })?;
        if !classes.contains(&job_type) {
            classes.push(job_type);
        }
    }
    if classes.is_empty() {
        return Err(ConfigError::Invalid {
            key: "WORKER_JOB_CLASSES".to_string(),
            value,
            reason: "no job classes listed".to_string(),
        });
    }
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_consume_every_class() {
        let settings = Settings::from_source(&source(&[("RABBITMQ_URL", "amqp://mq:5672")])).unwrap();
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.job_classes, JobType::ALL.to_vec());
        assert_eq!(settings.engine_timeout, None);
        assert_eq!(settings.cleanup, CleanupSettings::default());
        assert!(!settings.uses_memory_broker());
    }

    #[test]
    fn broker_url_is_required() {
        let err = Settings::from_source(&source(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("RABBITMQ_URL".to_string()));
    }

    #[test]
    fn job_classes_are_parsed_and_deduplicated() {
        let settings = Settings::from_source(&source(&[
            ("RABBITMQ_URL", "memory://"),
            ("WORKER_JOB_CLASSES", "executable, quantification,executable"),
            ("WORKER_CONCURRENCY", "4"),
            ("ENGINE_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(
            settings.job_classes,
            vec![JobType::Executable, JobType::Quantification]
        );
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.engine_timeout, Some(Duration::from_secs(30)));
        assert!(settings.uses_memory_broker());
    }

    #[test]
    fn unknown_job_class_is_rejected() {
        let err = Settings::from_source(&source(&[
            ("RABBITMQ_URL", "memory://"),
            ("WORKER_JOB_CLASSES", "quantification,render"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "WORKER_JOB_CLASSES"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Settings::from_source(&source(&[
            ("RABBITMQ_URL", "memory://"),
            ("WORKER_CONCURRENCY", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "WORKER_CONCURRENCY"));
    }
}
