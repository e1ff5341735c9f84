use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::PravahError;

// --- Severity and priority ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Multiplier applied to engagement when computing a priority score.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 1.0,
            Severity::Medium => 2.0,
            Severity::High => 3.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

impl FromStr for Severity {
    type Err = PravahError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(PravahError::Validation(format!("unknown severity '{other}'"))),
        }
    }
}

/// `engagement_count * severity_weight`.
pub fn priority_score(engagement_count: u64, severity: Severity) -> f64 {
    engagement_count as f64 * severity.weight()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Traffic,
    Weather,
    CivicIssues,
    Event,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Traffic => write!(f, "traffic"),
            Category::Weather => write!(f, "weather"),
            Category::CivicIssues => write!(f, "civic_issues"),
            Category::Event => write!(f, "event"),
        }
    }
}

impl FromStr for Category {
    type Err = PravahError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "traffic" => Ok(Category::Traffic),
            "weather" => Ok(Category::Weather),
            "civic_issues" => Ok(Category::CivicIssues),
            "event" => Ok(Category::Event),
            other => Err(PravahError::Validation(format!("unknown category '{other}'"))),
        }
    }
}

/// Where a scouted item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Twitter,
    Facebook,
    Event,
    Traffic,
    Weather,
    News,
    /// A canonical record re-entering as a stage-2 candidate.
    Analyzed,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Twitter => "twitter",
            SourceKind::Facebook => "facebook",
            SourceKind::Event => "event",
            SourceKind::Traffic => "traffic",
            SourceKind::Weather => "weather",
            SourceKind::News => "news",
            SourceKind::Analyzed => "analyzed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SourceKind {
    type Err = PravahError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "twitter" => Ok(SourceKind::Twitter),
            "facebook" => Ok(SourceKind::Facebook),
            "event" => Ok(SourceKind::Event),
            "traffic" => Ok(SourceKind::Traffic),
            "weather" => Ok(SourceKind::Weather),
            "news" => Ok(SourceKind::News),
            "analyzed" => Ok(SourceKind::Analyzed),
            other => Err(PravahError::Validation(format!("unknown source '{other}'"))),
        }
    }
}

// --- Cursor ordering key ---

/// Ordering key of a record within its stage's source collection.
///
/// Compared by timestamp first, then id, so records that share a timestamp
/// still have a strict order and "start after" never skips or repeats one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub at: DateTime<Utc>,
    pub id: String,
}

impl Watermark {
    pub fn new(at: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self { at, id: id.into() }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.at.to_rfc3339(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Stage1,
    Stage2,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Stage1 => "stage1",
            StageName::Stage2 => "stage2",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Records ---

/// A raw scouted item awaiting analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: String,
    pub content: String,
    pub location: String,
    pub source: SourceKind,
    pub engagement_count: u64,
    pub fetched_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.fetched_at, self.source_id.clone())
    }
}

/// The merged, deduplicated representation of one real-world event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub unique_id: String,
    pub category: Category,
    pub location: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub severity: Severity,
    pub priority_score: f64,
    pub engagement_count: u64,
    pub source_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Stage-2 ordering key. Updated records re-enter the stage-2 range.
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.updated_at, self.unique_id.clone())
    }

    /// Copy without the embedding, for payloads sent downstream.
    pub fn without_embedding(&self) -> Self {
        Self {
            embedding: Vec::new(),
            ..self.clone()
        }
    }
}

// --- Retrieval ---

/// One queryable knowledge-base partition: an index label plus a collection id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub label: String,
    pub kb_id: String,
}

impl Partition {
    pub fn new(label: impl Into<String>, kb_id: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kb_id: kb_id.into(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.label, self.kb_id)
    }
}

impl FromStr for Partition {
    type Err = PravahError;

    /// Parses `label.kb_id`. Only the first dot separates the two parts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('.') {
            Some((label, kb_id)) if !label.is_empty() && !kb_id.is_empty() => {
                Ok(Partition::new(label, kb_id))
            }
            _ => Err(PravahError::Config(format!(
                "partition '{s}' must have the form label.kb_id"
            ))),
        }
    }
}

/// A fused hit from the retrieval engine. Produced per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub record_id: String,
    pub parent_id: Option<String>,
    pub text: String,
    /// `label.kb_id` of the partition the hit came from.
    pub partition: String,
    pub vector_score: f64,
    pub lexical_score: f64,
    pub fused_score: f64,
    pub rank: usize,
}

// --- Classification outcomes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Same event, nothing new.
    Same,
    /// Unrelated.
    Different,
    /// Same event, the incoming text adds information.
    Additional,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Same => write!(f, "same"),
            Verdict::Different => write!(f, "different"),
            Verdict::Additional => write!(f, "additional"),
        }
    }
}

/// What happened to one item that went through a stage. Every item gets exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Created { record_id: String, mirrored: bool },
    Merged { record_id: String, mirrored: bool },
    SkippedDuplicate { matched_id: String },
    Failed { reason: String },
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }

    pub fn record_id(&self) -> Option<&str> {
        match self {
            ItemOutcome::Created { record_id, .. } | ItemOutcome::Merged { record_id, .. } => {
                Some(record_id)
            }
            ItemOutcome::SkippedDuplicate { matched_id } => Some(matched_id),
            ItemOutcome::Failed { .. } => None,
        }
    }
}
