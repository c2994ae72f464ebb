//! Backend selection and environment parsing for the object store.

use std::path::PathBuf;

use crate::StorageError;

const DEFAULT_FS_ROOT: &str = "./data/object_store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub virtual_hosted_style: bool,
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    S3(S3Config),
    Filesystem { root: PathBuf },
    Memory,
}

/// Names of the three top-level areas job blobs live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAreas {
    pub input: String,
    pub output: String,
    pub jobs: String,
}

impl Default for StorageAreas {
    fn default() -> Self {
        Self {
            input: "input".to_string(),
            output: "output".to_string(),
            jobs: "jobs".to_string(),
        }
    }
}

impl StorageAreas {
    /// `STORAGE_INPUT_AREA`, `STORAGE_OUTPUT_AREA`, `STORAGE_JOBS_AREA`.
    pub fn from_env() -> Result<Self, StorageError> {
        let defaults = Self::default();
        let areas = Self {
            input: env_non_empty("STORAGE_INPUT_AREA").unwrap_or(defaults.input),
            output: env_non_empty("STORAGE_OUTPUT_AREA").unwrap_or(defaults.output),
            jobs: env_non_empty("STORAGE_JOBS_AREA").unwrap_or(defaults.jobs),
        };
        areas.validate()?;
        Ok(areas)
    }

    /// Areas must be single, distinct path segments.
    pub fn validate(&self) -> Result<(), StorageError> {
        for area in [&self.input, &self.output, &self.jobs] {
            if area.is_empty() || area.contains('/') {
                return Err(StorageError::InvalidConfig(format!(
                    "storage area {area:?} must be a single path segment"
                )));
            }
        }
        if self.input == self.output || self.input == self.jobs || self.output == self.jobs {
            return Err(StorageError::InvalidConfig(
                "storage areas must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Optional key prefix applied to all object keys.
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackendConfig::Memory,
            prefix: None,
        }
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackendConfig::Filesystem { root: root.into() },
            prefix: None,
        }
    }

    pub fn s3(cfg: S3Config) -> Self {
        Self {
            backend: StorageBackendConfig::S3(cfg),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = non_empty(prefix.into());
        self
    }

    /// Build a config from environment variables.
    ///
    /// `STORAGE_BACKEND` picks `s3`, `filesystem` or `memory`; without it the
    /// filesystem backend rooted at `STORAGE_FS_ROOT` (default
    /// `./data/object_store`) is used.
    ///
    /// S3-compatible stores read `S3_BUCKET` (required), `AWS_REGION`
    /// (default `us-east-1`), `S3_ENDPOINT`, `S3_ALLOW_HTTP` (defaults to true
    /// for `http://` endpoints), `S3_VIRTUAL_HOSTED_STYLE` and the usual
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    ///
    /// `STORAGE_PREFIX` optionally namespaces every key.
    pub fn from_env() -> Result<Self, StorageError> {
        let backend = env_non_empty("STORAGE_BACKEND");
        let prefix = env_non_empty("STORAGE_PREFIX");

        let cfg = match backend.as_deref() {
            Some("s3") => Self::s3(read_s3_config()?),
            Some("filesystem") | Some("fs") | None => Self::filesystem(
                env_non_empty("STORAGE_FS_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FS_ROOT)),
            ),
            Some("memory") | Some("mem") => Self::memory(),
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported STORAGE_BACKEND={other} (expected s3|filesystem|memory)"
                )));
            }
        };

        Ok(Self { prefix, ..cfg })
    }
}

pub(crate) fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_non_empty(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().and_then(non_empty)
}

fn parse_bool_env(var_name: &str) -> Result<Option<bool>, StorageError> {
    let Some(v) = env_non_empty(var_name) else {
        return Ok(None);
    };

    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(Some(true)),
        "0" | "false" | "no" | "n" => Ok(Some(false)),
        _ => Err(StorageError::InvalidConfig(format!(
            "invalid boolean for {var_name}={v} (expected true/false)"
        ))),
    }
}

fn read_s3_config() -> Result<S3Config, StorageError> {
    let bucket = env_non_empty("S3_BUCKET").ok_or_else(|| {
        StorageError::InvalidConfig("S3_BUCKET is required for s3 backend".into())
    })?;
    let endpoint = env_non_empty("S3_ENDPOINT");
    let allow_http = match parse_bool_env("S3_ALLOW_HTTP")? {
        Some(v) => v,
        None => endpoint
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().starts_with("http://")),
    };

    Ok(S3Config {
        bucket,
        region: env_non_empty("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        endpoint,
        allow_http,
        access_key_id: env_non_empty("AWS_ACCESS_KEY_ID"),
        secret_access_key: env_non_empty("AWS_SECRET_ACCESS_KEY"),
        session_token: env_non_empty("AWS_SESSION_TOKEN"),
        virtual_hosted_style: parse_bool_env("S3_VIRTUAL_HOSTED_STYLE")?.unwrap_or(false),
    })
}
