//! In-memory stores for tests and local runs. No database required.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::sync::Mutex;

use pravah_common::{
    AckOutcome, CandidateRecord, CanonicalRecord, Job, JobState, Partition, PravahError,
    StageName, Watermark,
};

use crate::traits::{
    BatchReport, CanonicalStore, CursorStore, IndexDocument, JobStore, ScoredHit, SearchIndex,
    SourceStore,
};

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<StageName, Watermark>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, stage: StageName) -> Result<Option<Watermark>, PravahError> {
        Ok(self.cursors.lock().await.get(&stage).cloned())
    }

    async fn set(
        &self,
        stage: StageName,
        watermark: &Watermark,
    ) -> Result<Watermark, PravahError> {
        let mut cursors = self.cursors.lock().await;
        let current = cursors.entry(stage).or_insert_with(|| watermark.clone());
        if *watermark > *current {
            *current = watermark.clone();
        }
        Ok(current.clone())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown(job_id: &str) -> PravahError {
    PravahError::UnknownJob(job_id.to_string())
}

fn illegal(job: &Job, to: JobState) -> PravahError {
    PravahError::IllegalTransition {
        job_id: job.job_id.clone(),
        from: job.state.to_string(),
        to: to.to_string(),
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), PravahError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(active) = jobs.values().find(|j| !j.state.is_terminal()) {
            return Err(PravahError::JobConflict(active.job_id.clone()));
        }
        if jobs.contains_key(&job.job_id) {
            return Err(PravahError::JobConflict(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PravahError> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn active(&self) -> Result<Option<Job>, PravahError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.values().find(|j| !j.state.is_terminal()).cloned())
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
    ) -> Result<Job, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if job.state != from || !from.can_transition_to(to) {
            return Err(illegal(job, to));
        }
        job.state = to;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn record_stage1_dispatch(
        &self,
        job_id: &str,
        correlation_id: &str,
    ) -> Result<Job, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if job.state != JobState::DispatchingStage1 {
            return Err(illegal(job, JobState::DispatchingStage1));
        }
        job.dispatched_correlation_ids
            .insert(correlation_id.to_string());
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn withdraw_stage1_dispatch(
        &self,
        job_id: &str,
        correlation_id: &str,
    ) -> Result<Job, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if job.state != JobState::DispatchingStage1 {
            return Err(illegal(job, JobState::DispatchingStage1));
        }
        job.dispatched_correlation_ids.remove(correlation_id);
        if job.acked_correlation_ids.remove(correlation_id) {
            job.stage1_received = job.stage1_received.saturating_sub(1);
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn finish_stage1_dispatch(&self, job_id: &str) -> Result<Job, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if job.state != JobState::DispatchingStage1 {
            return Err(illegal(job, JobState::AwaitingStage1Acks));
        }
        job.stage1_expected = job.dispatched_correlation_ids.len() as u64;
        job.state = JobState::AwaitingStage1Acks;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn record_stage1_ack(
        &self,
        job_id: &str,
        correlation_id: &str,
    ) -> Result<AckOutcome, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if !job.dispatched_correlation_ids.contains(correlation_id) {
            return Err(crate::not_dispatched(job_id, correlation_id));
        }
        if job.state.is_terminal() {
            return Ok(AckOutcome {
                duplicate: true,
                job: job.clone(),
            });
        }
        let inserted = job.acked_correlation_ids.insert(correlation_id.to_string());
        if inserted {
            job.stage1_received += 1;
            job.updated_at = Utc::now();
        }
        Ok(AckOutcome {
            duplicate: !inserted,
            job: job.clone(),
        })
    }

    async fn claim_stage2(&self, job_id: &str) -> Result<Option<Job>, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if !job.barrier_reached() {
            return Ok(None);
        }
        job.state = JobState::DispatchingStage2;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn mark_stage2_sent(
        &self,
        job_id: &str,
        pending: Option<&Watermark>,
    ) -> Result<Job, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if job.state != JobState::DispatchingStage2 {
            return Err(illegal(job, JobState::AwaitingStage2Ack));
        }
        job.stage2_sent = true;
        job.stage2_attempts += 1;
        job.stage2_watermark = pending.cloned();
        job.state = JobState::AwaitingStage2Ack;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn record_stage2_ack(&self, job_id: &str) -> Result<AckOutcome, PravahError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| unknown(job_id))?;
        if job.stage2_ack || job.state.is_terminal() {
            return Ok(AckOutcome {
                duplicate: true,
                job: job.clone(),
            });
        }
        job.stage2_ack = true;
        if job.state == JobState::AwaitingStage2Ack {
            job.state = JobState::Done;
        }
        job.updated_at = Utc::now();
        Ok(AckOutcome {
            duplicate: false,
            job: job.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Scouted items keyed by their ordering key.
#[derive(Default)]
pub struct MemorySourceStore {
    items: Mutex<BTreeMap<Watermark, CandidateRecord>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn page_after(
        &self,
        after: Option<&Watermark>,
        limit: usize,
    ) -> Result<Vec<CandidateRecord>, PravahError> {
        let items = self.items.lock().await;
        Ok(items
            .iter()
            .filter(|(key, _)| after.map_or(true, |a| *key > a))
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn write_batch(&self, items: &[CandidateRecord]) -> Result<BatchReport, PravahError> {
        let mut store = self.items.lock().await;
        let mut report = BatchReport::default();
        for item in items {
            if item.source_id.trim().is_empty() {
                report
                    .failed
                    .push((item.source_id.clone(), "empty source_id".to_string()));
                continue;
            }
            store.retain(|_, existing| existing.source_id != item.source_id);
            store.insert(item.watermark(), item.clone());
            report.written.push(item.source_id.clone());
        }
        Ok(report)
    }
}

#[derive(Default)]
pub struct MemoryCanonicalStore {
    records: Mutex<HashMap<String, CanonicalRecord>>,
}

impl MemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, ordered by id.
    pub async fn all(&self) -> Vec<CanonicalRecord> {
        let records = self.records.lock().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        all
    }
}

#[async_trait]
impl CanonicalStore for MemoryCanonicalStore {
    async fn get(&self, unique_id: &str) -> Result<Option<CanonicalRecord>, PravahError> {
        Ok(self.records.lock().await.get(unique_id).cloned())
    }

    async fn find_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Option<CanonicalRecord>, PravahError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.source_ids.contains(source_id))
            .min_by(|a, b| a.unique_id.cmp(&b.unique_id))
            .cloned())
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), PravahError> {
        self.records
            .lock()
            .await
            .insert(record.unique_id.clone(), record.clone());
        Ok(())
    }

    async fn page_after(
        &self,
        after: Option<&Watermark>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, PravahError> {
        let records = self.records.lock().await;
        let mut page: Vec<_> = records
            .values()
            .filter(|r| after.map_or(true, |a| r.watermark() > *a))
            .cloned()
            .collect();
        page.sort_by_key(|r| r.watermark());
        page.truncate(limit);
        Ok(page)
    }

    async fn write_batch(&self, records: &[CanonicalRecord]) -> Result<BatchReport, PravahError> {
        let mut store = self.records.lock().await;
        let mut report = BatchReport::default();
        for record in records {
            if record.unique_id.trim().is_empty() {
                report
                    .failed
                    .push((record.unique_id.clone(), "empty unique_id".to_string()));
                continue;
            }
            store.insert(record.unique_id.clone(), record.clone());
            report.written.push(record.unique_id.clone());
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Search index
// ---------------------------------------------------------------------------

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "with",
];

/// Lowercased distinct terms, minus stopwords.
pub(crate) fn terms(text: &str) -> BTreeSet<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Cosine similarity rescaled to `[0, 1]`. Zero vectors score 0.5.
pub(crate) fn rescaled_cosine(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += *x as f64 * *y as f64;
        na += *x as f64 * *x as f64;
        nb += *y as f64 * *y as f64;
    }
    let cos = if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    };
    (1.0 + cos) / 2.0
}

/// Brute-force index. Vector search is always exact.
#[derive(Default)]
pub struct MemorySearchIndex {
    partitions: Mutex<HashMap<String, BTreeMap<String, IndexDocument>>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty partition so `has_partition` reports it.
    pub async fn create_partition(&self, partition: &Partition) {
        self.partitions
            .lock()
            .await
            .entry(partition.kb_id.clone())
            .or_default();
    }

    pub async fn len(&self, partition: &Partition) -> usize {
        self.partitions
            .lock()
            .await
            .get(&partition.kb_id)
            .map_or(0, |docs| docs.len())
    }
}

fn rank(mut hits: Vec<ScoredHit>, limit: usize) -> Vec<ScoredHit> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
    hits.truncate(limit);
    hits
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn vector_query(
        &self,
        partition: &Partition,
        vector: &[f32],
        limit: usize,
        _exact: bool,
    ) -> Result<Vec<ScoredHit>, PravahError> {
        let partitions = self.partitions.lock().await;
        let Some(docs) = partitions.get(&partition.kb_id) else {
            return Ok(Vec::new());
        };
        let hits = docs
            .values()
            .filter(|d| !d.embedding.is_empty())
            .map(|d| ScoredHit {
                record_id: d.record_id.clone(),
                parent_id: d.parent_id.clone(),
                text: d.text.clone(),
                score: rescaled_cosine(vector, &d.embedding),
            })
            .collect();
        Ok(rank(hits, limit))
    }

    async fn lexical_query(
        &self,
        partition: &Partition,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, PravahError> {
        let wanted = terms(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let partitions = self.partitions.lock().await;
        let Some(docs) = partitions.get(&partition.kb_id) else {
            return Ok(Vec::new());
        };
        let hits = docs
            .values()
            .filter_map(|d| {
                let matched = terms(&d.text).intersection(&wanted).count();
                (matched > 0).then(|| ScoredHit {
                    record_id: d.record_id.clone(),
                    parent_id: d.parent_id.clone(),
                    text: d.text.clone(),
                    score: matched as f64,
                })
            })
            .collect();
        Ok(rank(hits, limit))
    }

    async fn upsert(&self, partition: &Partition, doc: &IndexDocument) -> Result<(), PravahError> {
        self.partitions
            .lock()
            .await
            .entry(partition.kb_id.clone())
            .or_default()
            .insert(doc.record_id.clone(), doc.clone());
        Ok(())
    }

    async fn has_partition(&self, partition: &Partition) -> Result<bool, PravahError> {
        Ok(self.partitions.lock().await.contains_key(&partition.kb_id))
    }
}
