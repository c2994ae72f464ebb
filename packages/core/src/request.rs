//! Job requests and the wire envelope shared by producer and worker.
//!
//! Both sides validate with the same code: the producer before anything is
//! persisted, the worker before the job is marked running.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{JobId, JobType};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Validation failures for job payloads.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed {job_type} payload: {source}")]
    Malformed {
        job_type: JobType,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ValidationError {
    fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Quantification options plus the base64-encoded models to quantify.
///
/// Field names match the engine's command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuantifyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bdd: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zbdd: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mocus: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prime_implicants: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sil: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rare_event: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcub: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cut_off: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_trials: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_quantiles: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_bins: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_indent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<u8>,
    /// Ignored on input; the worker always chooses its own output file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Base64-encoded model documents.
    pub models: Vec<String>,
}

impl QuantifyRequest {
    /// Convenience constructor for a request over the given raw models.
    pub fn with_models<I, M>(models: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<[u8]>,
    {
        Self {
            models: models.into_iter().map(|m| BASE64.encode(m)).collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.models.is_empty() {
            return Err(ValidationError::field("models", "at least one model is required"));
        }
        for (index, model) in self.models.iter().enumerate() {
            if BASE64.decode(model.trim()).is_err() {
                return Err(ValidationError::field(
                    format!("models[{index}]"),
                    "not valid base64",
                ));
            }
        }
        if let Some(cut_off) = self.cut_off
            && !(0.0..=1.0).contains(&cut_off)
        {
            return Err(ValidationError::field("cut-off", "must be within [0, 1]"));
        }
        if let Some(mission_time) = self.mission_time
            && mission_time < 0.0
        {
            return Err(ValidationError::field("mission-time", "must not be negative"));
        }
        Ok(())
    }

    /// Decode every model into its raw bytes.
    pub fn decoded_models(&self) -> Result<Vec<Vec<u8>>, ValidationError> {
        self.models
            .iter()
            .enumerate()
            .map(|(index, model)| {
                BASE64
                    .decode(model.trim())
                    .map_err(|_| ValidationError::field(format!("models[{index}]"), "not valid base64"))
            })
            .collect()
    }
}

/// Allow-listed engine executables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Executable {
    #[serde(rename = "acube")]
    Acube,
    #[serde(rename = "dpc")]
    Dpc,
    #[serde(rename = "ftrex")]
    Ftrex,
    #[serde(rename = "qrecover")]
    Qrecover,
    #[serde(rename = "saphsolve")]
    Saphsolve,
    #[serde(rename = "scram-cli")]
    ScramCli,
    #[serde(rename = "xfta")]
    Xfta,
    #[serde(rename = "xfta2")]
    Xfta2,
}

/// Every allow-listed executable.
pub const EXECUTABLES: [Executable; 8] = [
    Executable::Acube,
    Executable::Dpc,
    Executable::Ftrex,
    Executable::Qrecover,
    Executable::Saphsolve,
    Executable::ScramCli,
    Executable::Xfta,
    Executable::Xfta2,
];

impl Executable {
    /// Binary name looked up in the engine directory.
    pub fn program(&self) -> &'static str {
        match self {
            Executable::Acube => "acube",
            Executable::Dpc => "dpc",
            Executable::Ftrex => "ftrex",
            Executable::Qrecover => "qrecover",
            Executable::Saphsolve => "saphsolve",
            Executable::ScramCli => "scram-cli",
            Executable::Xfta => "xfta",
            Executable::Xfta2 => "xfta2",
        }
    }
}

impl std::fmt::Display for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// An arbitrary invocation of an allow-listed executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub executable: Executable,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// Environment overrides as `KEY=VALUE`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default)]
    pub tty: bool,
}

impl ExecutionTask {
    pub fn new(executable: Executable) -> Self {
        Self {
            executable,
            arguments: Vec::new(),
            env_vars: Vec::new(),
            stdin: None,
            tty: false,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (index, entry) in self.env_vars.iter().enumerate() {
            match entry.split_once('=') {
                Some((key, _)) if !key.trim().is_empty() => {}
                _ => {
                    return Err(ValidationError::field(
                        format!("env_vars[{index}]"),
                        "expected KEY=VALUE",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Environment overrides split into key/value pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env_vars
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.to_string()))
            .collect()
    }
}

/// One child of a fan-out set: a single event sequence quantified on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceJob {
    pub parent_job_id: JobId,
    /// Child key within the parent set, `{parent}-{sequence}`.
    pub sequence_id: String,
    pub event_tree: String,
    pub sequence: String,
    pub request: QuantifyRequest,
}

impl SequenceJob {
    pub fn new(
        parent_job_id: JobId,
        event_tree: impl Into<String>,
        sequence: impl Into<String>,
        request: QuantifyRequest,
    ) -> Self {
        let sequence = sequence.into();
        Self {
            parent_job_id,
            sequence_id: format!("{parent_job_id}-{sequence}"),
            event_tree: event_tree.into(),
            sequence,
            request,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sequence.trim().is_empty() {
            return Err(ValidationError::field("sequence", "must not be empty"));
        }
        if self.sequence_id.trim().is_empty() || self.sequence_id.contains('/') {
            return Err(ValidationError::field(
                "sequence_id",
                "must be non-empty and must not contain '/'",
            ));
        }
        self.request.validate()
    }
}

/// A job request of any class.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    Quantification(QuantifyRequest),
    Executable(ExecutionTask),
    Sequence(SequenceJob),
}

/// The wire envelope: the job-class fields plus the injected job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage<T> {
    pub job_id: JobId,
    #[serde(flatten)]
    pub body: T,
}

impl JobRequest {
    pub fn job_type(&self) -> JobType {
        match self {
            JobRequest::Quantification(_) => JobType::Quantification,
            JobRequest::Executable(_) => JobType::Executable,
            JobRequest::Sequence(_) => JobType::DistributedSequenceChild,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobRequest::Quantification(request) => request.validate(),
            JobRequest::Executable(task) => task.validate(),
            JobRequest::Sequence(job) => job.validate(),
        }
    }

    /// The request body as stored on the job record.
    pub fn to_value(&self) -> Result<serde_json::Value, ValidationError> {
        let value = match self {
            JobRequest::Quantification(request) => serde_json::to_value(request),
            JobRequest::Executable(task) => serde_json::to_value(task),
            JobRequest::Sequence(job) => serde_json::to_value(job),
        };
        value.map_err(ValidationError::Encode)
    }

    /// Validate and serialize the request with `job_id` embedded.
    pub fn encode(&self, job_id: JobId) -> Result<Vec<u8>, ValidationError> {
        self.validate()?;
        let bytes = match self {
            JobRequest::Quantification(body) => serde_json::to_vec(&JobMessage { job_id, body }),
            JobRequest::Executable(body) => serde_json::to_vec(&JobMessage { job_id, body }),
            JobRequest::Sequence(body) => serde_json::to_vec(&JobMessage { job_id, body }),
        };
        bytes.map_err(ValidationError::Encode)
    }

    /// Parse and validate a raw payload for the given job class.
    pub fn decode(job_type: JobType, payload: &[u8]) -> Result<JobMessage<JobRequest>, ValidationError> {
        let malformed = |source| ValidationError::Malformed { job_type, source };
        let message = match job_type {
            JobType::Quantification => {
                let m: JobMessage<QuantifyRequest> =
                    serde_json::from_slice(payload).map_err(malformed)?;
                JobMessage {
                    job_id: m.job_id,
                    body: JobRequest::Quantification(m.body),
                }
            }
            JobType::Executable => {
                let m: JobMessage<ExecutionTask> =
                    serde_json::from_slice(payload).map_err(malformed)?;
                JobMessage {
                    job_id: m.job_id,
                    body: JobRequest::Executable(m.body),
                }
            }
            JobType::DistributedSequenceChild => {
                let m: JobMessage<SequenceJob> =
                    serde_json::from_slice(payload).map_err(malformed)?;
                JobMessage {
                    job_id: m.job_id,
                    body: JobRequest::Sequence(m.body),
                }
            }
        };
        message.body.validate()?;
        Ok(message)
    }
}
