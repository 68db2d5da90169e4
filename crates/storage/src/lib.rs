pub mod error;
pub mod ledger;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod models;
pub mod pg;
pub mod repos;

pub use error::{StorageError, StorageResult};
pub use ledger::Ledger;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryLedger;
pub use pg::PgLedger;
pub use sqlx::Pool;
pub use sqlx::Postgres;
pub use sqlx::postgres::PgPool;

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connect to PostgreSQL with a production-ready connection pool.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}
