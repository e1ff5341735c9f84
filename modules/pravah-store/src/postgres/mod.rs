//! Postgres stores (production).

mod cursors;
mod jobs;
mod records;
mod search;

pub use cursors::PgCursorStore;
pub use jobs::PgJobStore;
pub use records::{PgCanonicalStore, PgSourceStore};
pub use search::PgSearchIndex;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use pravah_common::PravahError;

/// Connect a pool and apply the embedded migrations.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PravahError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(db_err)?;
    migrate(&pool).await?;
    info!("Connected to Postgres and applied migrations");
    Ok(pool)
}

/// Run the embedded SQL migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), PravahError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PravahError::Anyhow(e.into()))
}

/// Classify a database error. Connection-level failures are transient;
/// integrity violations are validation errors.
pub(crate) fn db_err(e: sqlx::Error) -> PravahError {
    match &e {
        sqlx::Error::Database(db) if db.code().is_some_and(|c| c.starts_with("23")) => {
            PravahError::Validation(db.message().to_string())
        }
        sqlx::Error::Database(_)
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => PravahError::transient(e),
        _ => PravahError::Anyhow(e.into()),
    }
}

pub(crate) fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
