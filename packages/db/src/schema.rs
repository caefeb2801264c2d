//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the schema for a queue table.
///
/// The table is schemaless so producers can attach extra fields; only the
/// fields workers read are typed.
pub async fn init_schema(db: &Database, table: &str) -> Result<(), DbError> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::Query(format!("invalid table name: {table:?}")));
    }

    tracing::info!("Initializing database schema for table {}...", table);

    db.query(queue_schema(table)).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Queue record table schema.
fn queue_schema(table: &str) -> String {
    format!(
        r#"
-- Queue records awaiting execution
DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;

DEFINE FIELD IF NOT EXISTS payload ON {table} TYPE string;
DEFINE FIELD IF NOT EXISTS attempts ON {table} TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS reserved_at ON {table} TYPE string DEFAULT "";

-- Indexes for due-record polling
DEFINE INDEX IF NOT EXISTS {table}_reserved ON {table} FIELDS reserved_at;
DEFINE INDEX IF NOT EXISTS {table}_created ON {table} FIELDS created_at;
"#
    )
}
