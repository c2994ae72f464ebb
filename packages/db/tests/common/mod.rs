use db::{DbConfig, DbError, repositories::SurrealJobRepository};

/// Fresh repository over its own in-memory datastore.
pub async fn setup_repository() -> Result<SurrealJobRepository, DbError> {
    let db = db::init(&DbConfig::memory()).await?;
    Ok(SurrealJobRepository::new(db))
}
