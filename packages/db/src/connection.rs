//! Database connection setup.

use broker_core::{JobId, JobStatus};
use surrealdb::Surreal;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection handle; cheap to clone.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Engine endpoint: `mem://`, `ws://host:port`, `rocksdb://path`.
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "broker".to_string(),
            database: "jobs".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Read `DB_ENDPOINT`, `DB_NAMESPACE`, `DB_DATABASE`, `DB_USER` and `DB_PASS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = match (env_non_empty("DB_USER"), env_non_empty("DB_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Self {
            endpoint: env_non_empty("DB_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: env_non_empty("DB_NAMESPACE").unwrap_or(defaults.namespace),
            database: env_non_empty("DB_DATABASE").unwrap_or(defaults.database),
            credentials,
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Job {id} already exists")]
    AlreadyExists { id: JobId },
    #[error("Job {id} cannot move from {current} to {requested}")]
    InvalidTransition {
        id: JobId,
        current: JobStatus,
        requested: JobStatus,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Open a connection and select the configured namespace and database.
///
/// Every call returns an independent handle; `mem://` endpoints get their
/// own empty datastore.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!(endpoint = %config.endpoint, "Connecting to database");

    let db = any::connect(config.endpoint.as_str()).await?;

    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!(
        namespace = %config.namespace,
        database = %config.database,
        "Connected to database"
    );

    Ok(db)
}
