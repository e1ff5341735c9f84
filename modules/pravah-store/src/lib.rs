pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{
    MemoryCanonicalStore, MemoryCursorStore, MemoryJobStore, MemorySearchIndex, MemorySourceStore,
};
pub use postgres::{PgCanonicalStore, PgCursorStore, PgJobStore, PgSearchIndex, PgSourceStore};
pub use traits::*;

/// Ack for a correlation id the job never handed to the bus.
pub(crate) fn not_dispatched(job_id: &str, correlation_id: &str) -> pravah_common::PravahError {
    pravah_common::PravahError::Validation(format!(
        "correlation id {correlation_id} was not dispatched by job {job_id}"
    ))
}
