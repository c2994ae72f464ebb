//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// Statements are `IF NOT EXISTS`, so calling this on every start is safe.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
///
/// Optional outputs (`results`, `stdout`, ...) are only present once a job
/// has finished, so the table stays schemaless apart from the lifecycle
/// fields every record carries.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS job_type ON job TYPE string
    ASSERT $value IN ["quantification", "executable", "distributed-sequence-child"];
DEFINE FIELD IF NOT EXISTS status ON job TYPE string
    ASSERT $value IN ["pending", "running", "completed", "failed"];
DEFINE FIELD IF NOT EXISTS payload ON job TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE string;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE string;

DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
"#;
