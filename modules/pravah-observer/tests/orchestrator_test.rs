//! Orchestrator cycles against the in-memory stores and bus.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

use pravah_common::{
    Callback, CallbackStatus, CandidateRecord, CanonicalRecord, Category, Job, JobState,
    PipelineConfig, PravahError, RetryPolicy, Severity, SourceKind, StageName, Watermark,
};
use pravah_observer::{callback, MemoryBus, MessageBus, Orchestrator, OrchestratorDeps, WaitOutcome};
use pravah_store::{
    CanonicalStore, CursorStore, JobStore, MemoryCanonicalStore, MemoryCursorStore,
    MemoryJobStore, MemorySourceStore, SourceStore,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Stores {
    sources: Arc<MemorySourceStore>,
    canonical: Arc<MemoryCanonicalStore>,
    cursors: Arc<MemoryCursorStore>,
    jobs: Arc<MemoryJobStore>,
}

impl Stores {
    fn new() -> Self {
        Self {
            sources: Arc::new(MemorySourceStore::new()),
            canonical: Arc::new(MemoryCanonicalStore::new()),
            cursors: Arc::new(MemoryCursorStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
        }
    }

    fn orchestrator(&self, bus: Arc<dyn MessageBus>, config: PipelineConfig) -> Arc<Orchestrator> {
        let deps = OrchestratorDeps::builder()
            .sources(self.sources.clone())
            .canonical(self.canonical.clone())
            .cursors(self.cursors.clone())
            .jobs(self.jobs.clone())
            .bus(bus)
            .config(config)
            .retry(RetryPolicy::immediate(3))
            .build();
        Arc::new(Orchestrator::new(deps))
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        stage1_page_size: 2,
        stage1_record_cap: 100,
        stage2_batch_size: 5,
        ack_poll_interval: Duration::from_millis(5),
        cooldown: Duration::from_millis(5),
        stage2_ack_timeout: Duration::from_millis(30),
        max_stage2_attempts: 3,
        job_deadline: Duration::from_secs(30),
    }
}

fn item(source_id: &str, minute: u32) -> CandidateRecord {
    CandidateRecord {
        source_id: source_id.to_string(),
        content: format!("Report {source_id} from Indiranagar"),
        location: "Bengaluru".to_string(),
        source: SourceKind::Twitter,
        engagement_count: 3,
        fetched_at: Utc.with_ymd_and_hms(2025, 7, 1, 8, minute, 0).unwrap(),
    }
}

fn record(unique_id: &str, minute: u32) -> CanonicalRecord {
    let at = Utc.with_ymd_and_hms(2025, 7, 1, 10, minute, 0).unwrap();
    CanonicalRecord {
        unique_id: unique_id.to_string(),
        category: Category::Traffic,
        location: "Bengaluru".to_string(),
        text: format!("Canonical event {unique_id}"),
        embedding: vec![0.1, 0.2, 0.3],
        severity: Severity::Medium,
        priority_score: 6.0,
        engagement_count: 3,
        source_ids: BTreeSet::from([format!("src-{unique_id}")]),
        created_at: at,
        updated_at: at,
    }
}

async fn seed_items(stores: &Stores, items: &[CandidateRecord]) {
    let report = stores.sources.write_batch(items).await.unwrap();
    assert!(report.failed.is_empty());
}

async fn seed_records(stores: &Stores, records: &[CanonicalRecord]) {
    for r in records {
        stores.canonical.upsert(r).await.unwrap();
    }
}

fn stage1_ack(job_id: &str, source_id: &str) -> Callback {
    Callback {
        job_id: job_id.to_string(),
        correlation_id: Job::correlation_id(job_id, source_id),
        source: StageName::Stage1,
    }
}

fn stage2_ack(job_id: &str) -> Callback {
    Callback {
        job_id: job_id.to_string(),
        correlation_id: job_id.to_string(),
        source: StageName::Stage2,
    }
}

fn correlation_ids(published: &[Value]) -> Vec<String> {
    published
        .iter()
        .map(|p| p["correlation_id"].as_str().unwrap().to_string())
        .collect()
}

/// Acknowledges every message from inside `publish`, before publish returns.
struct AckingBus {
    inner: MemoryBus,
    orchestrator: OnceLock<Arc<Orchestrator>>,
    /// Delivered and acked, but the publish still reports a timeout.
    lost_response_for: Option<String>,
}

impl AckingBus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBus::new(),
            orchestrator: OnceLock::new(),
            lost_response_for: None,
        })
    }

    fn losing_response_for(source_id: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBus::new(),
            orchestrator: OnceLock::new(),
            lost_response_for: Some(source_id.to_string()),
        })
    }

    fn wire(&self, orchestrator: Arc<Orchestrator>) {
        let _ = self.orchestrator.set(orchestrator);
    }
}

#[async_trait]
impl MessageBus for AckingBus {
    async fn publish(&self, topic: StageName, payload: &Value) -> Result<(), PravahError> {
        self.inner.publish(topic, payload).await?;
        let callback = Callback {
            job_id: payload["job_id"].as_str().unwrap().to_string(),
            correlation_id: payload["correlation_id"].as_str().unwrap().to_string(),
            source: topic,
        };
        let orchestrator = self.orchestrator.get().unwrap();
        orchestrator.handle_callback(&callback).await?;
        if let Some(lost) = &self.lost_response_for {
            if payload["payload"]["source_id"] == lost.as_str() {
                return Err(PravahError::TransientIo("push timed out".to_string()));
            }
        }
        Ok(())
    }
}

/// Refuses every publish for one source id.
struct RefusingBus {
    inner: MemoryBus,
    refused_source: String,
}

#[async_trait]
impl MessageBus for RefusingBus {
    async fn publish(&self, topic: StageName, payload: &Value) -> Result<(), PravahError> {
        if payload["payload"]["source_id"] == self.refused_source.as_str() {
            return Err(PravahError::Validation("payload too large".to_string()));
        }
        self.inner.publish(topic, payload).await
    }
}

// =========================================================================
// Stage 1
// =========================================================================

#[tokio::test]
async fn stage1_publishes_each_item_once_with_job_scoped_correlation_ids() {
    let stores = Stores::new();
    let items = vec![item("a", 0), item("b", 1), item("c", 2), item("d", 3), item("e", 4)];
    seed_items(&stores, &items).await;
    let bus = Arc::new(MemoryBus::new());
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.state, JobState::AwaitingStage1Acks);
    assert_eq!(job.stage1_expected, 5);

    let published = bus.published(StageName::Stage1).await;
    let expected: Vec<_> = items
        .iter()
        .map(|i| Job::correlation_id(&job.job_id, &i.source_id))
        .collect();
    assert_eq!(correlation_ids(&published), expected);
    assert_eq!(published[0]["job_id"], job.job_id.as_str());
    assert_eq!(published[0]["payload"]["source_id"], "a");

    let cursor = stores.cursors.get(StageName::Stage1).await.unwrap();
    assert_eq!(cursor, Some(items[4].watermark()));
}

#[tokio::test]
async fn stage1_respects_the_record_cap() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1), item("c", 2)]).await;
    let bus = Arc::new(MemoryBus::new());
    let config = PipelineConfig {
        stage1_record_cap: 2,
        ..fast_config()
    };
    let orchestrator = stores.orchestrator(bus.clone(), config);

    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.stage1_expected, 2);
    assert_eq!(bus.published(StageName::Stage1).await.len(), 2);
    assert_eq!(
        stores.cursors.get(StageName::Stage1).await.unwrap(),
        Some(item("b", 1).watermark())
    );
}

#[tokio::test]
async fn publish_failure_stops_dispatch_at_that_record() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1), item("c", 2), item("d", 3)]).await;
    let bus = Arc::new(RefusingBus {
        inner: MemoryBus::new(),
        refused_source: "c".to_string(),
    });
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.stage1_expected, 2);
    assert_eq!(bus.inner.published(StageName::Stage1).await.len(), 2);
    assert_eq!(
        stores.cursors.get(StageName::Stage1).await.unwrap(),
        Some(item("b", 1).watermark()),
        "cursor stops before the record that was not published"
    );

    let refused = orchestrator.handle_callback(&stage1_ack(&job.job_id, "c")).await;
    assert!(matches!(refused, Err(PravahError::Validation(_))));
    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.stage1_received, 0);
}

#[tokio::test]
async fn ack_for_a_publish_that_failed_is_withdrawn() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1), item("c", 2)]).await;
    let bus = AckingBus::losing_response_for("b");
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());
    bus.wire(orchestrator.clone());

    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.stage1_expected, 1);
    assert_eq!(job.stage1_received, 1);
    assert_eq!(
        job.acked_correlation_ids,
        BTreeSet::from([Job::correlation_id(&job.job_id, "a")])
    );
    assert_eq!(job.state, JobState::Done, "nothing new for stage 2");
    assert_eq!(
        stores.cursors.get(StageName::Stage1).await.unwrap(),
        Some(item("a", 0).watermark())
    );
}

#[tokio::test]
async fn transient_publish_failures_are_retried() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1)]).await;
    let bus = Arc::new(MemoryBus::new());
    bus.fail_next(StageName::Stage1, 2).await;
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.stage1_expected, 2);
    assert_eq!(bus.published(StageName::Stage1).await.len(), 2);
}

#[tokio::test]
async fn second_job_is_rejected_while_one_is_active() {
    let stores = Stores::new();
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());

    let first = orchestrator.start_job().await.unwrap();
    let err = orchestrator.start_job().await.unwrap_err();
    assert!(matches!(err, PravahError::JobConflict(ref id) if *id == first.job_id));
}

// =========================================================================
// Barrier and stage 2
// =========================================================================

#[tokio::test]
async fn barrier_fires_stage2_exactly_once_under_duplicate_callbacks() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1), item("c", 2)]).await;
    seed_records(&stores, &[record("r1", 0), record("r2", 1)]).await;
    let bus = Arc::new(MemoryBus::new());
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    // Every ack delivered twice, all at once.
    let callbacks: Vec<_> = ["a", "b", "c", "a", "b", "c"]
        .iter()
        .map(|s| stage1_ack(&job.job_id, s))
        .collect();
    let statuses = join_all(callbacks.iter().map(|c| orchestrator.handle_callback(c))).await;
    let statuses: Vec<_> = statuses.into_iter().map(|s| s.unwrap()).collect();
    assert_eq!(statuses.iter().filter(|s| **s == CallbackStatus::Ok).count(), 3);
    assert_eq!(
        statuses.iter().filter(|s| **s == CallbackStatus::Duplicate).count(),
        3
    );

    let batches = bus.published(StageName::Stage2).await;
    assert_eq!(batches.len(), 1, "stage 2 dispatched exactly once");
    assert_eq!(batches[0]["correlation_id"], job.job_id.as_str());
    let batch = batches[0]["batch"].as_array().unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|r| r.get("embedding").is_none()));

    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.state, JobState::AwaitingStage2Ack);
    assert_eq!(job.stage1_received, 3);
    assert!(stores.cursors.get(StageName::Stage2).await.unwrap().is_none());

    let status = orchestrator.handle_callback(&stage2_ack(&job.job_id)).await.unwrap();
    assert_eq!(status, CallbackStatus::Ok);
    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Done);
    assert_eq!(
        stores.cursors.get(StageName::Stage2).await.unwrap(),
        Some(record("r2", 1).watermark())
    );

    let again = orchestrator.handle_callback(&stage2_ack(&job.job_id)).await.unwrap();
    assert_eq!(again, CallbackStatus::Duplicate);
}

#[tokio::test]
async fn stage2_batch_is_capped_at_the_batch_size() {
    let stores = Stores::new();
    let records: Vec<_> = (0..7).map(|i| record(&format!("r{i}"), i)).collect();
    seed_records(&stores, &records).await;
    let bus = Arc::new(MemoryBus::new());
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    let batches = bus.published(StageName::Stage2).await;
    assert_eq!(batches[0]["batch"].as_array().unwrap().len(), 5);
    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.stage2_watermark, Some(records[4].watermark()));
}

#[tokio::test]
async fn empty_cycle_finishes_without_a_stage2_message() {
    let stores = Stores::new();
    let bus = Arc::new(MemoryBus::new());
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.stage1_expected, 0);
    assert_eq!(job.state, JobState::Done);
    assert!(bus.published(StageName::Stage2).await.is_empty());
}

#[tokio::test]
async fn callbacks_are_validated() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0)]).await;
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());
    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    let unknown = orchestrator.handle_callback(&stage1_ack("job-missing", "a")).await;
    assert!(matches!(unknown, Err(PravahError::UnknownJob(_))));

    let foreign = Callback {
        job_id: job.job_id.clone(),
        correlation_id: "job-other-a".to_string(),
        source: StageName::Stage1,
    };
    let err = orchestrator.handle_callback(&foreign).await.unwrap_err();
    assert!(matches!(err, PravahError::Validation(_)));

    let wrong_stage2 = Callback {
        source: StageName::Stage2,
        ..stage1_ack(&job.job_id, "a")
    };
    let err = orchestrator.handle_callback(&wrong_stage2).await.unwrap_err();
    assert!(matches!(err, PravahError::Validation(_)));

    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.stage1_received, 0);
}

#[tokio::test]
async fn stray_acks_cannot_open_the_barrier() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1)]).await;
    seed_records(&stores, &[record("r1", 0)]).await;
    let bus = Arc::new(MemoryBus::new());
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());
    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    orchestrator
        .handle_callback(&stage1_ack(&job.job_id, "a"))
        .await
        .unwrap();
    for stray in ["never-sent", "z"] {
        let err = orchestrator
            .handle_callback(&stage1_ack(&job.job_id, stray))
            .await
            .unwrap_err();
        assert!(matches!(err, PravahError::Validation(_)));
    }

    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.state, JobState::AwaitingStage1Acks);
    assert_eq!(job.stage1_received, 1);
    assert!(bus.published(StageName::Stage2).await.is_empty());

    orchestrator
        .handle_callback(&stage1_ack(&job.job_id, "b"))
        .await
        .unwrap();
    let job = orchestrator.status(&job.job_id).await.unwrap();
    assert_eq!(job.stage1_received, job.stage1_expected);
    assert_eq!(job.state, JobState::AwaitingStage2Ack);
    assert_eq!(bus.published(StageName::Stage2).await.len(), 1);
}

// =========================================================================
// Races and full cycles
// =========================================================================

#[tokio::test]
async fn acks_that_arrive_during_dispatch_still_complete_the_job() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1), item("c", 2)]).await;
    seed_records(&stores, &[record("r1", 0)]).await;
    let bus = AckingBus::new();
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());
    bus.wire(orchestrator.clone());

    let (_tx, mut rx) = watch::channel(false);
    let outcome = orchestrator.run_job(&mut rx).await.unwrap();

    let WaitOutcome::Finished(job) = outcome else {
        panic!("job should finish");
    };
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.stage1_received, 3);
    assert_eq!(job.stage2_attempts, 1);
    assert_eq!(bus.inner.published(StageName::Stage2).await.len(), 1);
    assert_eq!(
        stores.cursors.get(StageName::Stage2).await.unwrap(),
        Some(record("r1", 0).watermark())
    );
}

#[tokio::test]
async fn cursors_only_move_forward_across_jobs() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1), item("c", 2)]).await;
    seed_records(&stores, &[record("r1", 0), record("r2", 1)]).await;
    let bus = AckingBus::new();
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());
    bus.wire(orchestrator.clone());
    let (_tx, mut rx) = watch::channel(false);

    orchestrator.run_job(&mut rx).await.unwrap();
    seed_items(&stores, &[item("d", 3), item("e", 4)]).await;
    let second = orchestrator.run_job(&mut rx).await.unwrap();

    let WaitOutcome::Finished(second) = second else {
        panic!("second job should finish");
    };
    assert_eq!(second.state, JobState::Done);
    assert_eq!(second.stage1_expected, 2);
    assert_eq!(second.stage2_attempts, 0, "nothing new for stage 2");

    let published = correlation_ids(&bus.inner.published(StageName::Stage1).await);
    let second_ids: Vec<_> = published
        .iter()
        .filter(|id| id.starts_with(&second.job_id))
        .cloned()
        .collect();
    assert_eq!(
        second_ids,
        vec![
            Job::correlation_id(&second.job_id, "d"),
            Job::correlation_id(&second.job_id, "e"),
        ]
    );
    assert_eq!(published.len(), 5, "no item dispatched twice");
    assert_eq!(bus.inner.published(StageName::Stage2).await.len(), 1);

    // A cursor write behind the stored one is ignored.
    let stored = stores
        .cursors
        .set(StageName::Stage1, &item("a", 0).watermark())
        .await
        .unwrap();
    assert_eq!(stored, item("e", 4).watermark());
}

#[tokio::test]
async fn missing_stage2_ack_is_redispatched_then_times_out() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0)]).await;
    seed_records(&stores, &[record("r1", 0)]).await;
    let bus = Arc::new(MemoryBus::new());
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();
    orchestrator
        .handle_callback(&stage1_ack(&job.job_id, "a"))
        .await
        .unwrap();

    let (_tx, mut rx) = watch::channel(false);
    let outcome = orchestrator
        .wait_for_completion(&job.job_id, &mut rx)
        .await
        .unwrap();

    let WaitOutcome::Finished(job) = outcome else {
        panic!("job should finish");
    };
    assert_eq!(job.state, JobState::TimedOut);
    assert_eq!(job.stage2_attempts, 3);

    let batches = bus.published(StageName::Stage2).await;
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| *b == batches[0]), "same batch every attempt");
    assert!(stores.cursors.get(StageName::Stage2).await.unwrap().is_none());
}

#[tokio::test]
async fn late_ack_after_redispatch_completes_the_job() {
    let stores = Stores::new();
    seed_records(&stores, &[record("r1", 0)]).await;
    let bus = Arc::new(MemoryBus::new());
    let config = PipelineConfig {
        stage2_ack_timeout: Duration::from_millis(20),
        max_stage2_attempts: 10,
        ..fast_config()
    };
    let orchestrator = stores.orchestrator(bus.clone(), config);

    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    let job_id = job.job_id.clone();
    let acker = orchestrator.clone();
    let late_ack = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        acker.handle_callback(&stage2_ack(&job_id)).await
    });

    let (_tx, mut rx) = watch::channel(false);
    let outcome = orchestrator
        .wait_for_completion(&job.job_id, &mut rx)
        .await
        .unwrap();
    late_ack.await.unwrap().unwrap();

    let WaitOutcome::Finished(job) = outcome else {
        panic!("job should finish");
    };
    assert_eq!(job.state, JobState::Done);
    assert!(job.stage2_attempts >= 2);
    assert_eq!(
        stores.cursors.get(StageName::Stage2).await.unwrap(),
        Some(record("r1", 0).watermark())
    );
}

#[tokio::test]
async fn passing_the_deadline_times_the_job_out() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0)]).await;
    let config = PipelineConfig {
        job_deadline: Duration::ZERO,
        ..fast_config()
    };
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), config);

    let (_tx, mut rx) = watch::channel(false);
    let outcome = orchestrator.run_job(&mut rx).await.unwrap();

    let WaitOutcome::Finished(job) = outcome else {
        panic!("job should finish");
    };
    assert_eq!(job.state, JobState::TimedOut);
    assert!(stores.jobs.active().await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_wait_leaves_the_job_active() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0)]).await;
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());

    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    let (tx, mut rx) = watch::channel(false);
    tx.send(true).unwrap();
    let outcome = orchestrator
        .wait_for_completion(&job.job_id, &mut rx)
        .await
        .unwrap();

    let WaitOutcome::Cancelled(job) = outcome else {
        panic!("wait should be cancelled");
    };
    assert_eq!(job.state, JobState::AwaitingStage1Acks);
    assert_eq!(stores.jobs.active().await.unwrap().map(|j| j.job_id), Some(job.job_id));
}

// =========================================================================
// Resume
// =========================================================================

#[tokio::test]
async fn resume_fires_a_barrier_reached_before_restart() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1)]).await;
    seed_records(&stores, &[record("r1", 0)]).await;

    // Previous process: dispatched and counted every ack, then died.
    let before = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());
    let job = before.start_job().await.unwrap();
    before.dispatch_stage1(&job.job_id).await.unwrap();
    for source_id in ["a", "b"] {
        stores
            .jobs
            .record_stage1_ack(&job.job_id, &Job::correlation_id(&job.job_id, source_id))
            .await
            .unwrap();
    }

    let bus = AckingBus::new();
    let after = stores.orchestrator(bus.clone(), fast_config());
    bus.wire(after.clone());

    let (_tx, mut rx) = watch::channel(false);
    let outcome = after.resume(&mut rx).await.unwrap();

    let Some(WaitOutcome::Finished(resumed)) = outcome else {
        panic!("resumed job should finish");
    };
    assert_eq!(resumed.job_id, job.job_id);
    assert_eq!(resumed.state, JobState::Done);
    assert_eq!(bus.inner.published(StageName::Stage2).await.len(), 1);
}

#[tokio::test]
async fn resume_times_out_a_job_interrupted_mid_dispatch() {
    let stores = Stores::new();
    let job = Job::new(Job::new_id(), Utc::now() + chrono::Duration::minutes(10));
    stores.jobs.create(&job).await.unwrap();
    stores
        .jobs
        .transition(&job.job_id, JobState::New, JobState::DispatchingStage1)
        .await
        .unwrap();

    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());
    let (_tx, mut rx) = watch::channel(false);
    let outcome = orchestrator.resume(&mut rx).await.unwrap();

    let Some(WaitOutcome::Finished(job)) = outcome else {
        panic!("interrupted job should be closed");
    };
    assert_eq!(job.state, JobState::TimedOut);
    assert!(stores.cursors.get(StageName::Stage1).await.unwrap().is_none());
}

#[tokio::test]
async fn resume_without_an_active_job_is_a_no_op() {
    let stores = Stores::new();
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());
    let (_tx, mut rx) = watch::channel(false);
    assert!(orchestrator.resume(&mut rx).await.unwrap().is_none());
}

#[tokio::test]
async fn run_forever_stops_on_cancel() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0)]).await;
    let bus = AckingBus::new();
    let orchestrator = stores.orchestrator(bus.clone(), fast_config());
    bus.wire(orchestrator.clone());

    let (tx, rx) = watch::channel(false);
    let runner = orchestrator.clone();
    let handle = tokio::spawn(async move { runner.run_forever(rx).await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    // Item "a" went out in the first cycle only.
    let published = bus.inner.published(StageName::Stage1).await;
    assert_eq!(published.len(), 1);
    assert!(stores.jobs.active().await.unwrap().is_none());
}

// =========================================================================
// HTTP
// =========================================================================

async fn post_callback(app: axum::Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::post("/callback")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn callback_endpoint_maps_outcomes_to_status_codes() {
    let stores = Stores::new();
    seed_items(&stores, &[item("a", 0), item("b", 1)]).await;
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());
    let job = orchestrator.start_job().await.unwrap();
    orchestrator.dispatch_stage1(&job.job_id).await.unwrap();
    let app = callback::build_router(orchestrator.clone());

    let ack = json!({
        "job_id": job.job_id,
        "correlation_id": Job::correlation_id(&job.job_id, "a"),
        "source": "stage1",
    });
    let (status, body) = post_callback(app.clone(), ack.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = post_callback(app.clone(), ack).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    let (status, body) = post_callback(
        app.clone(),
        json!({ "job_id": "job-missing", "correlation_id": "job-missing-a", "source": "stage1" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown job");

    let response = app
        .oneshot(
            Request::get(format!("/jobs/{}", job.job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let job: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(job["state"], "AWAITING_STAGE1_ACKS");
    assert_eq!(job["stage1_received"], 1);
}

#[tokio::test]
async fn stage2_watermark_is_reported_on_the_job() {
    let stores = Stores::new();
    seed_records(&stores, &[record("r1", 0)]).await;
    let orchestrator = stores.orchestrator(Arc::new(MemoryBus::new()), fast_config());
    let job = orchestrator.start_job().await.unwrap();
    let job = orchestrator.dispatch_stage1(&job.job_id).await.unwrap();

    assert_eq!(job.state, JobState::AwaitingStage2Ack);
    assert_eq!(
        job.stage2_watermark,
        Some(Watermark::new(record("r1", 0).updated_at, "r1"))
    );
}
