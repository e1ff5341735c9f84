//! Storage seams. Implemented by the Postgres stores (production) and the
//! memory stores (tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pravah_common::{
    AckOutcome, CandidateRecord, CanonicalRecord, Job, JobState, Partition, PravahError,
    StageName, Watermark,
};

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Durable per-stage watermark. The orchestrator is the only writer.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, stage: StageName) -> Result<Option<Watermark>, PravahError>;

    /// Store `watermark` unless the stored one is already later.
    /// Returns the watermark in effect after the call.
    async fn set(&self, stage: StageName, watermark: &Watermark)
        -> Result<Watermark, PravahError>;
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Durable job table. Every state change is a compare-and-set on the stored state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `JobConflict` while another job is non-terminal.
    async fn create(&self, job: &Job) -> Result<(), PravahError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PravahError>;

    /// The single non-terminal job, if any.
    async fn active(&self) -> Result<Option<Job>, PravahError>;

    /// Move `job_id` from `from` to `to`. Fails with `IllegalTransition` when the
    /// edge is not legal or the stored state is no longer `from`.
    async fn transition(&self, job_id: &str, from: JobState, to: JobState)
        -> Result<Job, PravahError>;

    /// Register a stage-1 message before it is handed to the bus. Only legal
    /// while the job is `DispatchingStage1`.
    async fn record_stage1_dispatch(&self, job_id: &str, correlation_id: &str)
        -> Result<Job, PravahError>;

    /// Undo `record_stage1_dispatch` after the bus refused the message. An ack
    /// that raced in for it is dropped with it.
    async fn withdraw_stage1_dispatch(&self, job_id: &str, correlation_id: &str)
        -> Result<Job, PravahError>;

    /// Fix `stage1_expected` to the number of registered dispatches and move
    /// `DispatchingStage1 → AwaitingStage1Acks`.
    async fn finish_stage1_dispatch(&self, job_id: &str) -> Result<Job, PravahError>;

    /// Count a stage-1 ack once per correlation id. Ids that were never
    /// dispatched for the job are a `Validation` error.
    async fn record_stage1_ack(&self, job_id: &str, correlation_id: &str)
        -> Result<AckOutcome, PravahError>;

    /// Atomically claim stage 2 once the barrier is reached
    /// (`AwaitingStage1Acks → DispatchingStage2`). `None` when the barrier is not
    /// reached or another caller already claimed it.
    async fn claim_stage2(&self, job_id: &str) -> Result<Option<Job>, PravahError>;

    /// Record a stage-2 publish: `stage2_sent`, one more attempt, the pending
    /// stage-2 watermark, and `DispatchingStage2 → AwaitingStage2Ack`.
    async fn mark_stage2_sent(&self, job_id: &str, pending: Option<&Watermark>)
        -> Result<Job, PravahError>;

    /// Record the stage-2 ack. Completes the job when it is awaiting the ack.
    async fn record_stage2_ack(&self, job_id: &str) -> Result<AckOutcome, PravahError>;
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-item result of a batch write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub written: Vec<String>,
    /// `(id, reason)` for every item that was not written.
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.written.len() + self.failed.len()
    }

    /// `PartialBatchFailure` when any item failed.
    pub fn into_result(self) -> Result<Self, PravahError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(PravahError::PartialBatchFailure {
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }
}

/// Raw scouted items, read in `(fetched_at, source_id)` order.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn page_after(&self, after: Option<&Watermark>, limit: usize)
        -> Result<Vec<CandidateRecord>, PravahError>;

    async fn write_batch(&self, items: &[CandidateRecord]) -> Result<BatchReport, PravahError>;
}

/// Canonical records, read for stage 2 in `(updated_at, unique_id)` order.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn get(&self, unique_id: &str) -> Result<Option<CanonicalRecord>, PravahError>;

    /// The record that already folded in `source_id`, if any.
    async fn find_by_source_id(&self, source_id: &str)
        -> Result<Option<CanonicalRecord>, PravahError>;

    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), PravahError>;

    async fn page_after(&self, after: Option<&Watermark>, limit: usize)
        -> Result<Vec<CanonicalRecord>, PravahError>;

    async fn write_batch(&self, records: &[CanonicalRecord]) -> Result<BatchReport, PravahError>;
}

// ---------------------------------------------------------------------------
// Search index
// ---------------------------------------------------------------------------

/// A document mirrored into a search partition.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub record_id: String,
    pub parent_id: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// One hit of a single-list query, in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub record_id: String,
    pub parent_id: Option<String>,
    pub text: String,
    pub score: f64,
}

/// Secondary search index. One instance serves every partition under its label.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Nearest neighbours by cosine similarity, scored `(1 + cos) / 2`.
    async fn vector_query(
        &self,
        partition: &Partition,
        vector: &[f32],
        limit: usize,
        exact: bool,
    ) -> Result<Vec<ScoredHit>, PravahError>;

    /// Full-text matches, scored by the number of distinct query terms matched.
    async fn lexical_query(
        &self,
        partition: &Partition,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, PravahError>;

    async fn upsert(&self, partition: &Partition, doc: &IndexDocument)
        -> Result<(), PravahError>;

    async fn has_partition(&self, partition: &Partition) -> Result<bool, PravahError>;
}
