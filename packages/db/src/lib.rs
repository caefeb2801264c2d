//! SurrealDB integration for the job processing engine.
//!
//! This crate provides database connectivity and a durable
//! [`queue_core::RecordStore`] implementation for queue records.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
mod store;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::init_schema;
pub use store::SurrealRecordStore;

/// Connect with the given configuration and open the queue record store.
pub async fn open_store(config: &DbConfig) -> Result<SurrealRecordStore, DbError> {
    let db = connect(config).await?;
    SurrealRecordStore::new(db).await
}
