use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::schema::MemoryRegistry;

/// An in-memory SQLite pool pinned to one connection.
///
/// Each SQLite connection to `:memory:` opens its own database, so a larger pool would
/// scatter tables across connections.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

/// Runs each statement in order on the pool.
pub async fn run_script(pool: &SqlitePool, statements: &[&str]) -> Result<(), sqlx::Error> {
    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

/// A registry loaded from a JSON array of model declarations.
pub fn registry_from_json(models: &str) -> MemoryRegistry {
    match MemoryRegistry::from_json(models) {
        Ok(registry) => registry,
        Err(err) => panic!("invalid test models: {}", err),
    }
}
