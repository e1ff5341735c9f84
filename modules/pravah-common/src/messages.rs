//! Wire shapes exchanged over the message bus and the callback endpoint.

use serde::{Deserialize, Serialize};

use crate::error::PravahError;
use crate::types::{CandidateRecord, CanonicalRecord, StageName};

/// Stage-1 message: one scouted record per message.
///
/// Workers receive it as `Envelope<serde_json::Value>` so a bad payload can
/// still be acknowledged under its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub job_id: String,
    pub correlation_id: String,
    pub payload: T,
}

impl Envelope<serde_json::Value> {
    /// Decode the payload as a candidate record.
    pub fn candidate(&self) -> Result<CandidateRecord, PravahError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            PravahError::Validation(format!(
                "stage-1 payload for {} is not a candidate record: {e}",
                self.correlation_id
            ))
        })
    }
}

/// Stage-2 message: one batch of canonical records per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub job_id: String,
    pub correlation_id: String,
    pub batch: Vec<CanonicalRecord>,
}

/// Acknowledgment sent by a stage worker to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub job_id: String,
    pub correlation_id: String,
    pub source: StageName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Ok,
    /// Correlation id was already counted; nothing changed.
    Duplicate,
}
