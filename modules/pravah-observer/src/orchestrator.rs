//! Drives one pipeline cycle at a time: stage-1 fan-out, the ack barrier,
//! the stage-2 batch, and the wait for its ack.
//!
//! All job state lives in the job store; every state change is a
//! compare-and-set there, so callbacks handled concurrently with the loop
//! cannot fire stage 2 twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use pravah_common::{
    retry_transient, BatchEnvelope, Callback, CallbackStatus, CandidateRecord, Envelope, Job,
    JobState, PipelineConfig, PravahError, RetryPolicy, StageName, Watermark,
};
use pravah_store::{CanonicalStore, CursorStore, JobStore, SourceStore};

use crate::bus::MessageBus;

#[derive(Clone, TypedBuilder)]
pub struct OrchestratorDeps {
    pub sources: Arc<dyn SourceStore>,
    pub canonical: Arc<dyn CanonicalStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub jobs: Arc<dyn JobStore>,
    pub bus: Arc<dyn MessageBus>,
    #[builder(default)]
    pub config: PipelineConfig,
    #[builder(default)]
    pub retry: RetryPolicy,
}

/// How waiting on a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The job reached a terminal state.
    Finished(Job),
    /// The cancellation signal fired first; the job stays resumable.
    Cancelled(Job),
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self { deps }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.deps.config
    }

    // -----------------------------------------------------------------------
    // Job lifecycle
    // -----------------------------------------------------------------------

    /// Create a new job. Fails with `JobConflict` while another job is active.
    pub async fn start_job(&self) -> Result<Job, PravahError> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.deps.config.job_deadline)
                .map_err(|e| PravahError::Config(format!("job deadline: {e}")))?;
        let job = Job::new(Job::new_id(), deadline);
        self.deps.jobs.create(&job).await?;
        info!(job_id = %job.job_id, deadline = %job.deadline, "Job created");
        Ok(job)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, PravahError> {
        self.deps
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PravahError::UnknownJob(job_id.to_string()))
    }

    /// Publish up to the record cap of scouted items after the stage-1 cursor,
    /// one message each, then fix the expected ack count.
    pub async fn dispatch_stage1(&self, job_id: &str) -> Result<Job, PravahError> {
        let config = &self.deps.config;
        self.deps
            .jobs
            .transition(job_id, JobState::New, JobState::DispatchingStage1)
            .await?;

        let mut after = self.deps.cursors.get(StageName::Stage1).await?;
        let mut last: Option<Watermark> = None;
        let mut dispatched = 0usize;

        'pages: while dispatched < config.stage1_record_cap {
            let limit = config.stage1_page_size.min(config.stage1_record_cap - dispatched);
            let page = retry_transient(&self.deps.retry, "stage-1 page", || {
                self.deps.sources.page_after(after.as_ref(), limit)
            })
            .await?;
            let page_len = page.len();

            for item in page {
                if let Err(e) = self.publish_item(job_id, &item).await {
                    warn!(
                        job_id,
                        source_id = %item.source_id,
                        error = %e,
                        "Publish failed, stopping dispatch at this record"
                    );
                    break 'pages;
                }
                dispatched += 1;
                last = Some(item.watermark());
            }

            if page_len < limit {
                break;
            }
            after = last.clone();
        }

        if let Some(watermark) = &last {
            let stored = self.deps.cursors.set(StageName::Stage1, watermark).await?;
            info!(job_id, cursor = %stored, "Stage-1 cursor advanced");
        }

        let job = self.deps.jobs.finish_stage1_dispatch(job_id).await?;
        info!(
            job_id,
            expected = job.stage1_expected,
            received = job.stage1_received,
            "Stage-1 dispatch finished"
        );

        // Acks that arrived while dispatching were counted but could not fire
        // the barrier until the expected count was final.
        self.fire_barrier(job_id).await?;
        self.status(job_id).await
    }

    async fn publish_item(&self, job_id: &str, item: &CandidateRecord) -> Result<(), PravahError> {
        let envelope = Envelope {
            job_id: job_id.to_string(),
            correlation_id: Job::correlation_id(job_id, &item.source_id),
            payload: item,
        };
        let payload = serde_json::to_value(&envelope)?;

        // Registered first: the worker may ack before publish returns.
        self.deps
            .jobs
            .record_stage1_dispatch(job_id, &envelope.correlation_id)
            .await?;
        let published = retry_transient(&self.deps.retry, "stage-1 publish", || {
            self.deps.bus.publish(StageName::Stage1, &payload)
        })
        .await;
        if let Err(e) = published {
            self.deps
                .jobs
                .withdraw_stage1_dispatch(job_id, &envelope.correlation_id)
                .await?;
            return Err(e);
        }
        Ok(())
    }

    /// Claim and dispatch stage 2 if the barrier is reached. Only one caller
    /// can win the claim.
    async fn fire_barrier(&self, job_id: &str) -> Result<(), PravahError> {
        if let Some(job) = self.deps.jobs.claim_stage2(job_id).await? {
            info!(job_id, received = job.stage1_received, "Barrier reached, dispatching stage 2");
            self.dispatch_stage2(job_id).await?;
        }
        Ok(())
    }

    /// Publish one batch of canonical records after the stage-2 cursor. The job
    /// must be in `DispatchingStage2`. The cursor itself moves only on ack.
    pub async fn dispatch_stage2(&self, job_id: &str) -> Result<Job, PravahError> {
        let after = self.deps.cursors.get(StageName::Stage2).await?;
        let batch = retry_transient(&self.deps.retry, "stage-2 page", || {
            self.deps
                .canonical
                .page_after(after.as_ref(), self.deps.config.stage2_batch_size)
        })
        .await?;

        let Some(pending) = batch.last().map(|r| r.watermark()) else {
            info!(job_id, "Nothing new for stage 2, job done");
            return self
                .deps
                .jobs
                .transition(job_id, JobState::DispatchingStage2, JobState::Done)
                .await;
        };

        let envelope = BatchEnvelope {
            job_id: job_id.to_string(),
            correlation_id: job_id.to_string(),
            batch: batch.iter().map(|r| r.without_embedding()).collect(),
        };
        let payload = serde_json::to_value(&envelope)?;
        retry_transient(&self.deps.retry, "stage-2 publish", || {
            self.deps.bus.publish(StageName::Stage2, &payload)
        })
        .await?;

        let job = self.deps.jobs.mark_stage2_sent(job_id, Some(&pending)).await?;
        info!(
            job_id,
            records = envelope.batch.len(),
            attempt = job.stage2_attempts,
            "Stage-2 batch published"
        );

        // The ack beat us here: it was recorded while we were still dispatching.
        if job.stage2_ack {
            let job = self
                .deps
                .jobs
                .transition(job_id, JobState::AwaitingStage2Ack, JobState::Done)
                .await?;
            self.commit_stage2(&job).await?;
            return Ok(job);
        }
        Ok(job)
    }

    async fn commit_stage2(&self, job: &Job) -> Result<(), PravahError> {
        if let Some(watermark) = &job.stage2_watermark {
            let stored = self.deps.cursors.set(StageName::Stage2, watermark).await?;
            info!(job_id = %job.job_id, cursor = %stored, "Stage-2 cursor advanced");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    /// Apply one worker acknowledgment.
    pub async fn handle_callback(&self, callback: &Callback) -> Result<CallbackStatus, PravahError> {
        let job_id = callback.job_id.as_str();
        self.status(job_id).await?;

        match callback.source {
            StageName::Stage1 => {
                let outcome = self
                    .deps
                    .jobs
                    .record_stage1_ack(job_id, &callback.correlation_id)
                    .await?;
                if outcome.duplicate {
                    info!(job_id, correlation_id = %callback.correlation_id, "Duplicate stage-1 ack ignored");
                    return Ok(CallbackStatus::Duplicate);
                }
                info!(
                    job_id,
                    received = outcome.job.stage1_received,
                    expected = outcome.job.stage1_expected,
                    state = %outcome.job.state,
                    "Stage-1 ack recorded"
                );
                if outcome.job.barrier_reached() {
                    self.fire_barrier(job_id).await?;
                }
                Ok(CallbackStatus::Ok)
            }
            StageName::Stage2 => {
                if callback.correlation_id != job_id {
                    return Err(PravahError::Validation(format!(
                        "stage-2 correlation id {} must equal the job id",
                        callback.correlation_id
                    )));
                }
                let outcome = self.deps.jobs.record_stage2_ack(job_id).await?;
                if outcome.duplicate {
                    return Ok(CallbackStatus::Duplicate);
                }
                info!(job_id, state = %outcome.job.state, "Stage-2 ack recorded");
                if outcome.job.state == JobState::Done {
                    self.commit_stage2(&outcome.job).await?;
                }
                Ok(CallbackStatus::Ok)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    /// Poll until the job is terminal. Re-dispatches stage 2 when its ack is
    /// late, times the job out after the last attempt or at its deadline.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome, PravahError> {
        let config = &self.deps.config;
        let mut since = Instant::now();
        let mut seen_attempts = 0u32;

        loop {
            let job = self.status(job_id).await?;
            if job.state.is_terminal() {
                info!(job_id, state = %job.state, "Job finished");
                return Ok(WaitOutcome::Finished(job));
            }
            if Utc::now() >= job.deadline {
                warn!(job_id, state = %job.state, "Job deadline passed");
                return self.time_out(job).await.map(WaitOutcome::Finished);
            }

            match job.state {
                JobState::DispatchingStage2 | JobState::AwaitingStage2Ack => {
                    if job.stage2_attempts != seen_attempts {
                        seen_attempts = job.stage2_attempts;
                        since = Instant::now();
                    }
                    if since.elapsed() >= config.stage2_ack_timeout {
                        if job.stage2_attempts >= config.max_stage2_attempts {
                            warn!(job_id, attempts = job.stage2_attempts, "Stage-2 ack never arrived");
                            return self.time_out(job).await.map(WaitOutcome::Finished);
                        }
                        warn!(job_id, attempts = job.stage2_attempts, "Stage-2 ack late, re-dispatching");
                        if let Err(e) = self.redispatch_stage2(&job).await {
                            error!(job_id, error = %e, "Stage-2 re-dispatch failed");
                        }
                        since = Instant::now();
                    }
                }
                _ => since = Instant::now(),
            }

            tokio::select! {
                _ = tokio::time::sleep(config.ack_poll_interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!(job_id, "Wait cancelled");
                        return Ok(WaitOutcome::Cancelled(self.status(job_id).await?));
                    }
                }
            }
        }
    }

    async fn redispatch_stage2(&self, job: &Job) -> Result<Job, PravahError> {
        if job.state == JobState::AwaitingStage2Ack {
            self.deps
                .jobs
                .transition(&job.job_id, JobState::AwaitingStage2Ack, JobState::DispatchingStage2)
                .await?;
        }
        self.dispatch_stage2(&job.job_id).await
    }

    /// Mark `job` timed out. If it finished concurrently, return it as is.
    async fn time_out(&self, job: Job) -> Result<Job, PravahError> {
        match self
            .deps
            .jobs
            .transition(&job.job_id, job.state, JobState::TimedOut)
            .await
        {
            Ok(job) => {
                warn!(job_id = %job.job_id, "Job timed out");
                Ok(job)
            }
            Err(PravahError::IllegalTransition { .. }) => self.status(&job.job_id).await,
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Start a job, dispatch stage 1 and wait for it to finish.
    pub async fn run_job(&self, cancel: &mut watch::Receiver<bool>) -> Result<WaitOutcome, PravahError> {
        let job = self.start_job().await?;
        if let Err(e) = self.dispatch_stage1(&job.job_id).await {
            error!(job_id = %job.job_id, error = %e, "Stage-1 dispatch failed");
            let current = self.status(&job.job_id).await?;
            if !current.state.is_terminal() {
                self.time_out(current).await?;
            }
            return Err(e);
        }
        self.wait_for_completion(&job.job_id, cancel).await
    }

    /// Pick up a job left active by a previous process. `None` when there is none.
    pub async fn resume(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<WaitOutcome>, PravahError> {
        let Some(job) = self.deps.jobs.active().await? else {
            return Ok(None);
        };
        info!(job_id = %job.job_id, state = %job.state, "Resuming active job");

        match job.state {
            JobState::New => {
                self.dispatch_stage1(&job.job_id).await?;
            }
            // The expected count was never fixed and the stage-1 cursor was not
            // saved, so the next job re-dispatches the same records.
            JobState::DispatchingStage1 => {
                return self.time_out(job).await.map(|j| Some(WaitOutcome::Finished(j)));
            }
            JobState::AwaitingStage1Acks => self.fire_barrier(&job.job_id).await?,
            JobState::DispatchingStage2 => {
                self.dispatch_stage2(&job.job_id).await?;
            }
            _ => {}
        }
        self.wait_for_completion(&job.job_id, cancel).await.map(Some)
    }

    /// One job at a time, a cooldown between jobs, until cancelled.
    pub async fn run_forever(&self, mut cancel: watch::Receiver<bool>) {
        match self.resume(&mut cancel).await {
            Ok(Some(WaitOutcome::Cancelled(_))) => return,
            Ok(_) => {}
            Err(e) => error!(error = %e, "Resume failed"),
        }

        loop {
            if *cancel.borrow() {
                break;
            }
            match self.run_job(&mut cancel).await {
                Ok(WaitOutcome::Cancelled(job)) => {
                    info!(job_id = %job.job_id, "Stopping with job still active");
                    break;
                }
                Ok(WaitOutcome::Finished(job)) => {
                    info!(job_id = %job.job_id, state = %job.state, "Job complete");
                }
                Err(PravahError::JobConflict(active)) => {
                    warn!(active_job = %active, "Another job is active, skipping cycle");
                }
                Err(e) => error!(error = %e, "Job failed"),
            }

            info!(cooldown_secs = self.deps.config.cooldown.as_secs(), "Cooling down");
            if sleep_or_cancel(self.deps.config.cooldown, &mut cancel).await {
                break;
            }
        }
        info!("Orchestrator stopped");
    }
}

/// Sleep for `duration`. Returns true when cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
    }
}
