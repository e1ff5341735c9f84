use thiserror::Error;

#[derive(Error, Debug)]
pub enum PravahError {
    /// Store, bus or provider call failed in a way that may succeed on retry.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed payload or provider output. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Partial batch failure: {failed} of {total} items failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Retrieval partition {partition} failed: {reason}")]
    RetrievalPartition { partition: String, reason: String },

    #[error("Retrieval unavailable: all {0} partitions failed")]
    RetrievalUnavailable(usize),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Job conflict: job {0} is still active")]
    JobConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PravahError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        PravahError::TransientIo(err.to_string())
    }

    pub fn validation(err: impl std::fmt::Display) -> Self {
        PravahError::Validation(err.to_string())
    }

    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, PravahError::TransientIo(_))
    }
}

impl From<serde_json::Error> for PravahError {
    fn from(err: serde_json::Error) -> Self {
        PravahError::Validation(err.to_string())
    }
}
