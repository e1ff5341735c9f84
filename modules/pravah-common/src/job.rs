//! Job bookkeeping shared by the orchestrator and the job stores.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PravahError;
use crate::types::Watermark;

/// Lifecycle of one pipeline cycle.
///
/// `New → DispatchingStage1 → AwaitingStage1Acks → DispatchingStage2 →
/// AwaitingStage2Ack → Done`, with `TimedOut` reachable from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    DispatchingStage1,
    AwaitingStage1Acks,
    DispatchingStage2,
    AwaitingStage2Ack,
    Done,
    TimedOut,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::DispatchingStage1 => "DISPATCHING_STAGE1",
            JobState::AwaitingStage1Acks => "AWAITING_STAGE1_ACKS",
            JobState::DispatchingStage2 => "DISPATCHING_STAGE2",
            JobState::AwaitingStage2Ack => "AWAITING_STAGE2_ACK",
            JobState::Done => "DONE",
            JobState::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::TimedOut)
    }

    /// Legal edges of the state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (New, DispatchingStage1)
            | (DispatchingStage1, AwaitingStage1Acks)
            | (AwaitingStage1Acks, DispatchingStage2)
            | (DispatchingStage2, AwaitingStage2Ack)
            // stage-2 range was empty
            | (DispatchingStage2, Done)
            | (AwaitingStage2Ack, Done)
            // re-dispatch after an ack timeout
            | (AwaitingStage2Ack, DispatchingStage2) => true,
            (from, TimedOut) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = PravahError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(JobState::New),
            "DISPATCHING_STAGE1" => Ok(JobState::DispatchingStage1),
            "AWAITING_STAGE1_ACKS" => Ok(JobState::AwaitingStage1Acks),
            "DISPATCHING_STAGE2" => Ok(JobState::DispatchingStage2),
            "AWAITING_STAGE2_ACK" => Ok(JobState::AwaitingStage2Ack),
            "DONE" => Ok(JobState::Done),
            "TIMED_OUT" => Ok(JobState::TimedOut),
            other => Err(PravahError::Validation(format!("unknown job state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub state: JobState,
    pub stage1_expected: u64,
    pub stage1_received: u64,
    pub stage2_sent: bool,
    pub stage2_ack: bool,
    /// Stage-1 messages handed to the bus. Only these can be acknowledged.
    pub dispatched_correlation_ids: BTreeSet<String>,
    pub acked_correlation_ids: BTreeSet<String>,
    pub stage2_attempts: u32,
    /// Stage-2 cursor to commit once the stage-2 ack arrives.
    pub stage2_watermark: Option<Watermark>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            state: JobState::New,
            stage1_expected: 0,
            stage1_received: 0,
            stage2_sent: false,
            stage2_ack: false,
            dispatched_correlation_ids: BTreeSet::new(),
            acked_correlation_ids: BTreeSet::new(),
            stage2_attempts: 0,
            stage2_watermark: None,
            created_at: now,
            updated_at: now,
            deadline,
        }
    }

    pub fn new_id() -> String {
        format!("job-{}", Uuid::new_v4())
    }

    /// Correlation id of the stage-1 message for one source record.
    pub fn correlation_id(job_id: &str, source_id: &str) -> String {
        format!("{job_id}-{source_id}")
    }

    /// Every dispatched stage-1 message has been acknowledged and stage 2 is unclaimed.
    pub fn barrier_reached(&self) -> bool {
        self.state == JobState::AwaitingStage1Acks
            && self.stage1_received == self.stage1_expected
            && !self.stage2_sent
    }
}

/// Result of recording one acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct AckOutcome {
    /// The ack had already been counted; nothing changed.
    pub duplicate: bool,
    /// The job after the ack was applied.
    pub job: Job,
}
