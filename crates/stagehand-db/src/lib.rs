//! Persistence layer for Stagehand.
//!
//! Provides store traits with version-checked updates, an in-memory
//! implementation and a PostgreSQL implementation.

pub mod error;
pub mod memory;
pub mod pg;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
