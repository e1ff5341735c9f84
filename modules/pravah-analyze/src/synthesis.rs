//! Stage-2 worker: folds a batch of canonical records into synthesized events
//! and acknowledges the batch once.
//!
//! Each canonical record goes through the same dedup pipeline as a scouted
//! item, against the synthesis partition and the synthesized-event store.

use std::sync::Arc;

use tracing::info;

use pravah_common::{
    BatchEnvelope, Callback, CandidateRecord, CanonicalRecord, PravahError, SourceKind, StageName,
};

use crate::classifier::Classifier;
use crate::merge::MergeLayer;
use crate::worker::{acknowledge, AckSink, BatchReport, Deduplicator, EnvelopeError};

/// Parse a raw stage-2 message. Records are decoded here; a batch that does not
/// decode is rejected and the orchestrator re-dispatches it.
pub fn parse_batch_envelope(body: &[u8]) -> Result<BatchEnvelope, EnvelopeError> {
    let envelope: BatchEnvelope =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if envelope.job_id.trim().is_empty() {
        return Err(EnvelopeError::MissingJobId);
    }
    if envelope.correlation_id.trim().is_empty() {
        return Err(EnvelopeError::MissingCorrelationId);
    }
    Ok(envelope)
}

/// A canonical record as a stage-2 candidate.
///
/// Keyed by the record's watermark, so a record that was updated after it was
/// synthesized counts as a new contribution while a redelivered batch does not.
pub fn as_candidate(record: &CanonicalRecord) -> CandidateRecord {
    CandidateRecord {
        source_id: record.watermark().to_string(),
        content: record.text.clone(),
        location: record.location.clone(),
        source: SourceKind::Analyzed,
        engagement_count: record.engagement_count,
        fetched_at: record.updated_at,
    }
}

pub struct Stage2Worker {
    items: Deduplicator,
    acks: Arc<dyn AckSink>,
}

impl Stage2Worker {
    pub fn new(classifier: Classifier, merge: MergeLayer, acks: Arc<dyn AckSink>) -> Self {
        Self {
            items: Deduplicator::new(classifier, merge),
            acks,
        }
    }

    /// Synthesize every record in the batch, then send the single stage-2 ack.
    /// Failed records are reported, not retried; only a failed ack is an error.
    pub async fn process_message(&self, envelope: BatchEnvelope) -> Result<BatchReport, PravahError> {
        let candidates: Vec<CandidateRecord> = envelope.batch.iter().map(as_candidate).collect();
        let report = self.items.process_batch(&candidates).await;

        let callback = Callback {
            job_id: envelope.job_id,
            correlation_id: envelope.correlation_id,
            source: StageName::Stage2,
        };
        acknowledge(self.acks.as_ref(), &callback).await?;

        info!(
            job_id = %callback.job_id,
            records = report.items.len(),
            failed = report.failed(),
            "Stage-2 batch synthesized and acknowledged"
        );
        Ok(report)
    }
}
