use db::{DbConfig, DbError, SurrealRecordStore};

/// Open a store on a fresh in-memory database.
pub async fn setup_store() -> Result<SurrealRecordStore, DbError> {
    db::open_store(&DbConfig::memory()).await
}
