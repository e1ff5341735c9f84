//! Applies classifier decisions to the canonical store and its search mirror.
//!
//! The two writes are not transactional. The canonical store is written first
//! and is the source of truth; the mirror catches up on the next write of the
//! same record if its upsert keeps failing.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use pravah_common::{
    priority_score, retry_transient, CandidateRecord, CanonicalRecord, ItemAnalyzer, ItemOutcome,
    PairJudge, Partition, PravahError, RetryPolicy, TextEmbedder,
};
use pravah_store::{CanonicalStore, IndexDocument, SearchIndex};

use crate::classifier::Classification;

#[derive(TypedBuilder)]
pub struct MergeLayer {
    canonical: Arc<dyn CanonicalStore>,
    index: Arc<dyn SearchIndex>,
    /// Partition the mirror writes go to.
    partition: Partition,
    embedder: Arc<dyn TextEmbedder>,
    judge: Arc<dyn PairJudge>,
    analyzer: Arc<dyn ItemAnalyzer>,
    #[builder(default)]
    retry: RetryPolicy,
}

impl MergeLayer {
    pub async fn apply(
        &self,
        item: &CandidateRecord,
        classification: Classification,
    ) -> Result<ItemOutcome, PravahError> {
        match classification {
            Classification::Same { matched_id } => {
                info!(source_id = %item.source_id, %matched_id, "Duplicate item skipped");
                Ok(ItemOutcome::SkippedDuplicate { matched_id })
            }
            Classification::Additional { matched } => self.merge_into(&matched.record_id, item).await,
            Classification::Different => self.create(item).await,
        }
    }

    /// The record `source_id` already contributed to, if any.
    pub async fn owner_of(&self, source_id: &str) -> Result<Option<String>, PravahError> {
        let record = retry_transient(&self.retry, "canonical source lookup", || {
            self.canonical.find_by_source_id(source_id)
        })
        .await?;
        Ok(record.map(|r| r.unique_id))
    }

    /// Fold `item` into the canonical record `record_id`.
    pub async fn merge_into(
        &self,
        record_id: &str,
        item: &CandidateRecord,
    ) -> Result<ItemOutcome, PravahError> {
        let mut record = retry_transient(&self.retry, "canonical get", || {
            self.canonical.get(record_id)
        })
        .await?
        .ok_or_else(|| {
            PravahError::Validation(format!(
                "matched record {record_id} is not in the canonical store"
            ))
        })?;

        // Redelivered message: this source already contributed to the record.
        if record.source_ids.contains(&item.source_id) {
            info!(source_id = %item.source_id, record_id, "Source already merged, skipping");
            return Ok(ItemOutcome::SkippedDuplicate {
                matched_id: record_id.to_string(),
            });
        }

        if adds_nothing(&record.text, &item.content) {
            info!(source_id = %item.source_id, record_id, "No new detail, keeping text");
        } else {
            let merged = self.judge.merge(&record.text, &item.content).await?;
            record.embedding = self.embedder.embed(&merged).await?;
            record.text = merged;
        }

        record.engagement_count += item.engagement_count;
        record.source_ids.insert(item.source_id.clone());
        record.priority_score = priority_score(record.engagement_count, record.severity);
        record.updated_at = Utc::now();

        let mirrored = self.persist(&record).await?;
        info!(
            source_id = %item.source_id,
            record_id,
            engagement_count = record.engagement_count,
            sources = record.source_ids.len(),
            mirrored,
            "Item merged"
        );
        Ok(ItemOutcome::Merged {
            record_id: record.unique_id,
            mirrored,
        })
    }

    /// Analyze `item` and store it as a new canonical record.
    pub async fn create(&self, item: &CandidateRecord) -> Result<ItemOutcome, PravahError> {
        let analysis = self.analyzer.analyze(item).await?;
        let embedding = self.embedder.embed(&analysis.text).await?;
        let now = Utc::now();

        let record = CanonicalRecord {
            unique_id: Uuid::new_v4().to_string(),
            category: analysis.category,
            location: analysis.location,
            text: analysis.text,
            embedding,
            severity: analysis.severity,
            priority_score: priority_score(item.engagement_count, analysis.severity),
            engagement_count: item.engagement_count,
            source_ids: BTreeSet::from([item.source_id.clone()]),
            created_at: now,
            updated_at: now,
        };

        let mirrored = self.persist(&record).await?;
        info!(
            source_id = %item.source_id,
            record_id = %record.unique_id,
            category = %record.category,
            severity = %record.severity,
            mirrored,
            "Canonical record created"
        );
        Ok(ItemOutcome::Created {
            record_id: record.unique_id,
            mirrored,
        })
    }

    /// Canonical write (must succeed), then the mirror write. Returns whether
    /// the mirror took the write.
    async fn persist(&self, record: &CanonicalRecord) -> Result<bool, PravahError> {
        retry_transient(&self.retry, "canonical upsert", || self.canonical.upsert(record)).await?;

        let doc = IndexDocument {
            record_id: record.unique_id.clone(),
            parent_id: None,
            text: record.text.clone(),
            embedding: record.embedding.clone(),
        };
        match retry_transient(&self.retry, "mirror upsert", || {
            self.index.upsert(&self.partition, &doc)
        })
        .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    record_id = %record.unique_id,
                    partition = %self.partition,
                    error = %e,
                    "Mirror write failed, canonical store is ahead of the index"
                );
                Ok(false)
            }
        }
    }
}

/// Lowercased alphanumeric tokens joined by single spaces, padded so that
/// containment checks match whole tokens.
fn normalize(text: &str) -> String {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", tokens.join(" "))
}

/// The incoming text equals, or is contained in, the stored text.
pub fn adds_nothing(existing: &str, incoming: &str) -> bool {
    let incoming = normalize(incoming);
    incoming.trim().is_empty() || normalize(existing).contains(&incoming)
}
