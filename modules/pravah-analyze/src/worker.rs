//! Stage-1 worker: one scouted item in, one outcome out, one ack back to the
//! orchestrator. The per-item dedup pipeline is shared with stage 2.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use pravah_common::{
    retry_transient, Callback, CandidateRecord, Envelope, ItemOutcome, PravahError, RetryPolicy,
    StageName,
};

use crate::classifier::Classifier;
use crate::merge::MergeLayer;

// ---------------------------------------------------------------------------
// Acknowledgments
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AckSink: Send + Sync {
    async fn ack(&self, callback: &Callback) -> Result<(), PravahError>;
}

/// POSTs callbacks to the orchestrator, retrying transient failures.
pub struct HttpAckSink {
    http: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpAckSink {
    pub fn new(url: impl Into<String>) -> Result<Self, PravahError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PravahError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post(&self, callback: &Callback) -> Result<(), PravahError> {
        let response = self
            .http
            .post(&self.url)
            .json(callback)
            .send()
            .await
            .map_err(PravahError::transient)?;

        match response.status() {
            s if s.is_success() => Ok(()),
            s if s == StatusCode::NOT_FOUND => Err(PravahError::UnknownJob(callback.job_id.clone())),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(PravahError::transient(format!("callback returned {s}")))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(PravahError::Validation(format!("callback rejected ({s}): {body}")))
            }
        }
    }
}

#[async_trait]
impl AckSink for HttpAckSink {
    async fn ack(&self, callback: &Callback) -> Result<(), PravahError> {
        retry_transient(&self.retry, "ack", || self.post(callback)).await
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// One outcome per item, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_failure()).count()
    }

    /// `PartialBatchFailure` when any item failed.
    pub fn into_result(self) -> Result<Self, PravahError> {
        match self.failed() {
            0 => Ok(self),
            failed => Err(PravahError::PartialBatchFailure {
                failed,
                total: self.items.len(),
            }),
        }
    }
}

/// Envelope problems that make a message impossible to acknowledge.
#[derive(Error, Debug, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Malformed(String),
    #[error("envelope has no job_id")]
    MissingJobId,
    #[error("envelope has no correlation_id")]
    MissingCorrelationId,
}

/// Parse a raw stage-1 message. Only the ids are checked here; the payload is
/// decoded later so a bad one can still be acknowledged.
pub fn parse_envelope(body: &[u8]) -> Result<Envelope<serde_json::Value>, EnvelopeError> {
    let envelope: Envelope<serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if envelope.job_id.trim().is_empty() {
        return Err(EnvelopeError::MissingJobId);
    }
    if envelope.correlation_id.trim().is_empty() {
        return Err(EnvelopeError::MissingCorrelationId);
    }
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Skip redeliveries, classify against the stage's partition, apply the
/// decision. Used by both stage workers.
pub struct Deduplicator {
    classifier: Classifier,
    merge: MergeLayer,
}

impl Deduplicator {
    pub fn new(classifier: Classifier, merge: MergeLayer) -> Self {
        Self { classifier, merge }
    }

    /// Classify and persist one item. Errors become a `failed` outcome.
    pub async fn process_item(&self, item: &CandidateRecord) -> ItemOutcome {
        match self.try_process(item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(source_id = %item.source_id, error = %e, "Item failed");
                ItemOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_process(&self, item: &CandidateRecord) -> Result<ItemOutcome, PravahError> {
        if item.content.trim().is_empty() {
            return Err(PravahError::Validation(format!(
                "item {} has empty content",
                item.source_id
            )));
        }

        // Redelivered message: the first delivery already stored this source.
        if let Some(matched_id) = self.merge.owner_of(&item.source_id).await? {
            info!(source_id = %item.source_id, %matched_id, "Source already stored, skipping");
            return Ok(ItemOutcome::SkippedDuplicate { matched_id });
        }

        let classification = self.classifier.classify(&item.content).await?;
        info!(
            source_id = %item.source_id,
            verdict = %classification.verdict(),
            "Item classified"
        );
        self.merge.apply(item, classification).await
    }

    /// Process `items` one after another. A failing item never drops the rest.
    pub async fn process_batch(&self, items: &[CandidateRecord]) -> BatchReport {
        let mut report = BatchReport::default();
        for item in items {
            report.items.push(ItemReport {
                source_id: item.source_id.clone(),
                outcome: self.process_item(item).await,
            });
        }
        info!(total = report.items.len(), failed = report.failed(), "Batch processed");
        report
    }
}

/// Send `callback`, logging a failure before returning it.
pub(crate) async fn acknowledge(acks: &dyn AckSink, callback: &Callback) -> Result<(), PravahError> {
    acks.ack(callback).await.map_err(|e| {
        error!(
            job_id = %callback.job_id,
            correlation_id = %callback.correlation_id,
            source = %callback.source,
            error = %e,
            "Ack failed"
        );
        e
    })
}

pub struct Stage1Worker {
    items: Deduplicator,
    acks: Arc<dyn AckSink>,
}

impl Stage1Worker {
    pub fn new(classifier: Classifier, merge: MergeLayer, acks: Arc<dyn AckSink>) -> Self {
        Self {
            items: Deduplicator::new(classifier, merge),
            acks,
        }
    }

    /// Handle one stage-1 message and acknowledge it. The item outcome is
    /// returned even when it failed; only a failed ack is an error.
    pub async fn process_message(
        &self,
        envelope: Envelope<serde_json::Value>,
    ) -> Result<ItemReport, PravahError> {
        let report = match envelope.candidate() {
            Ok(item) => ItemReport {
                outcome: self.items.process_item(&item).await,
                source_id: item.source_id,
            },
            Err(e) => {
                warn!(correlation_id = %envelope.correlation_id, error = %e, "Undecodable payload, acknowledging as failed");
                ItemReport {
                    source_id: String::new(),
                    outcome: ItemOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
        };

        let callback = Callback {
            job_id: envelope.job_id,
            correlation_id: envelope.correlation_id,
            source: StageName::Stage1,
        };
        acknowledge(self.acks.as_ref(), &callback).await?;

        info!(
            job_id = %callback.job_id,
            correlation_id = %callback.correlation_id,
            source_id = %report.source_id,
            "Message processed and acknowledged"
        );
        Ok(report)
    }

    /// Process `items` without acknowledging anything.
    pub async fn process_batch(&self, items: &[CandidateRecord]) -> BatchReport {
        self.items.process_batch(items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ids_are_required() {
        assert_eq!(
            parse_envelope(br#"{"job_id":"","correlation_id":"c","payload":{}}"#).unwrap_err(),
            EnvelopeError::MissingJobId
        );
        assert_eq!(
            parse_envelope(br#"{"job_id":"job-1","correlation_id":" ","payload":{}}"#).unwrap_err(),
            EnvelopeError::MissingCorrelationId
        );
        assert!(matches!(
            parse_envelope(br#"{"correlation_id":"c"}"#),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(parse_envelope(b"not json"), Err(EnvelopeError::Malformed(_))));

        let ok = parse_envelope(br#"{"job_id":"job-1","correlation_id":"job-1-7","payload":{"x":1}}"#)
            .unwrap();
        assert_eq!(ok.correlation_id, "job-1-7");
    }

    #[test]
    fn batch_report_counts_failures() {
        let report = BatchReport {
            items: vec![
                ItemReport {
                    source_id: "a".into(),
                    outcome: ItemOutcome::Created { record_id: "r1".into(), mirrored: true },
                },
                ItemReport {
                    source_id: "b".into(),
                    outcome: ItemOutcome::Failed { reason: "llm".into() },
                },
            ],
        };
        assert_eq!(report.failed(), 1);
        assert!(matches!(
            report.into_result(),
            Err(PravahError::PartialBatchFailure { failed: 1, total: 2 })
        ));
    }

    #[test]
    fn item_report_flattens_outcome() {
        let json = serde_json::to_value(ItemReport {
            source_id: "12345".into(),
            outcome: ItemOutcome::Merged { record_id: "r1".into(), mirrored: true },
        })
        .unwrap();
        assert_eq!(json["source_id"], "12345");
        assert_eq!(json["outcome"], "merged");
        assert_eq!(json["record_id"], "r1");
    }
}
