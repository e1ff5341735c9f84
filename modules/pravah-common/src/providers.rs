//! Seams to the external model providers.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::PravahError;
use crate::types::{CandidateRecord, Category, Severity, Verdict};

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PravahError>;
}

/// Pairwise relation judge.
#[async_trait]
pub trait PairJudge: Send + Sync {
    /// How `incoming` relates to the already-stored `existing` text.
    async fn classify(&self, existing: &str, incoming: &str) -> Result<Verdict, PravahError>;

    /// Combine two texts about the same event, keeping every detail from both.
    async fn merge(&self, existing: &str, incoming: &str) -> Result<String, PravahError>;
}

/// Structured analysis of a new scouted item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Analysis {
    /// One of traffic, weather, civic_issues, event
    pub category: Category,
    /// Geographic location usable for geocoding
    pub location: String,
    /// One of low, medium, high
    pub severity: Severity,
    /// Concise summary that keeps every important detail
    pub text: String,
}

#[async_trait]
pub trait ItemAnalyzer: Send + Sync {
    async fn analyze(&self, item: &CandidateRecord) -> Result<Analysis, PravahError>;
}
