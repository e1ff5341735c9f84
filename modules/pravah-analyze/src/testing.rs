// Test doubles for the analyze stage.
//
// - ScriptedJudge (PairJudge): rule-based verdicts, records every call
// - FixedEmbedder (TextEmbedder): deterministic hash-based vectors
// - KeywordAnalyzer (ItemAnalyzer): category from keywords, text = content
// - RecordingAckSink (AckSink): keeps every callback it is sent
// - GatedAckSink (AckSink): holds every callback until the gate opens
// - FailingIndex (SearchIndex): every call is a transient failure

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use pravah_common::{
    Analysis, Callback, CandidateRecord, Category, ItemAnalyzer, PairJudge, Partition, PravahError,
    Severity, TextEmbedder, Verdict,
};
use pravah_store::{IndexDocument, ScoredHit, SearchIndex};

use crate::worker::AckSink;

// ---------------------------------------------------------------------------
// ScriptedJudge
// ---------------------------------------------------------------------------

struct Rule {
    existing: String,
    incoming: String,
    verdict: Verdict,
}

/// Verdicts from substring rules, checked in registration order. A pair no rule
/// matches is `different`. `merge` concatenates the two texts.
#[derive(Default)]
pub struct ScriptedJudge {
    rules: Vec<Rule>,
    calls: Mutex<Vec<String>>,
    merges: Mutex<u32>,
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// `verdict` whenever the stored text contains `existing`.
    pub fn on_pair(self, existing: &str, verdict: Verdict) -> Self {
        self.when(existing, "", verdict)
    }

    /// `verdict` when the stored text contains `existing` and the incoming text
    /// contains `incoming`.
    pub fn when(mut self, existing: &str, incoming: &str, verdict: Verdict) -> Self {
        self.rules.push(Rule {
            existing: existing.to_string(),
            incoming: incoming.to_string(),
            verdict,
        });
        self
    }

    /// Stored texts the judge was asked about, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn merges(&self) -> u32 {
        *self.merges.lock().unwrap()
    }
}

#[async_trait]
impl PairJudge for ScriptedJudge {
    async fn classify(&self, existing: &str, incoming: &str) -> Result<Verdict, PravahError> {
        self.calls.lock().unwrap().push(existing.to_string());
        Ok(self
            .rules
            .iter()
            .find(|r| existing.contains(&r.existing) && incoming.contains(&r.incoming))
            .map_or(Verdict::Different, |r| r.verdict))
    }

    async fn merge(&self, existing: &str, incoming: &str) -> Result<String, PravahError> {
        *self.merges.lock().unwrap() += 1;
        Ok(format!("{} {}", existing.trim_end_matches('.'), incoming))
    }
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder. Registered texts get exact vectors; anything else
/// gets a unit vector seeded from its hash (low similarity to everything).
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    dimension: usize,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            dimension,
        }
    }

    pub fn on_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish();

        let mut vec = vec![0.0f32; self.dimension];
        for v in vec.iter_mut() {
            // LCG
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *v = ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0;
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PravahError> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.hash_vector(text)))
    }
}

// ---------------------------------------------------------------------------
// KeywordAnalyzer
// ---------------------------------------------------------------------------

pub struct KeywordAnalyzer {
    severity: Severity,
}

impl KeywordAnalyzer {
    pub fn new() -> Self {
        Self {
            severity: Severity::Medium,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl Default for KeywordAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemAnalyzer for KeywordAnalyzer {
    async fn analyze(&self, item: &CandidateRecord) -> Result<Analysis, PravahError> {
        let text = item.content.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| text.contains(w));
        let category = if has(&["traffic", "jam", "accident"]) {
            Category::Traffic
        } else if has(&["rain", "flood", "storm"]) {
            Category::Weather
        } else if has(&["concert", "festival", "match"]) {
            Category::Event
        } else {
            Category::CivicIssues
        };
        Ok(Analysis {
            category,
            location: item.location.clone(),
            severity: self.severity,
            text: item.content.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingAckSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingAckSink {
    sent: Mutex<Vec<Callback>>,
}

impl RecordingAckSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Callback> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AckSink for RecordingAckSink {
    async fn ack(&self, callback: &Callback) -> Result<(), PravahError> {
        self.sent.lock().unwrap().push(callback.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GatedAckSink
// ---------------------------------------------------------------------------

/// Blocks each `ack` until `open` is called, then records into `inner`.
pub struct GatedAckSink {
    inner: Arc<RecordingAckSink>,
    gate: Notify,
}

impl GatedAckSink {
    pub fn new(inner: Arc<RecordingAckSink>) -> Self {
        Self {
            inner,
            gate: Notify::new(),
        }
    }

    /// Let one waiting (or the next) ack through.
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl AckSink for GatedAckSink {
    async fn ack(&self, callback: &Callback) -> Result<(), PravahError> {
        self.gate.notified().await;
        self.inner.ack(callback).await
    }
}

// ---------------------------------------------------------------------------
// FailingIndex
// ---------------------------------------------------------------------------

pub struct FailingIndex;

#[async_trait]
impl SearchIndex for FailingIndex {
    async fn vector_query(
        &self,
        _partition: &Partition,
        _vector: &[f32],
        _limit: usize,
        _exact: bool,
    ) -> Result<Vec<ScoredHit>, PravahError> {
        Err(PravahError::transient("index unreachable"))
    }

    async fn lexical_query(
        &self,
        _partition: &Partition,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<ScoredHit>, PravahError> {
        Err(PravahError::transient("index unreachable"))
    }

    async fn upsert(&self, _partition: &Partition, _doc: &IndexDocument) -> Result<(), PravahError> {
        Err(PravahError::transient("index unreachable"))
    }

    async fn has_partition(&self, _partition: &Partition) -> Result<bool, PravahError> {
        Err(PravahError::transient("index unreachable"))
    }
}
