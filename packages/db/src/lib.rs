//! SurrealDB-backed record store for broker jobs.
//!
//! The crate owns one [`Database`] handle per caller instead of a
//! process-wide connection; the handle is passed to
//! [`repositories::SurrealJobRepository`] and shared from there.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `remote`: Connect to a SurrealDB server over websockets
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::init_schema;

/// Connect with the given configuration and make sure the schema exists.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
