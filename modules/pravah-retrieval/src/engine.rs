use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use pravah_common::{Partition, PravahError, RetrievalConfig, RetrievalResult, TextEmbedder};
use pravah_store::SearchIndex;

use crate::fusion;

/// Hybrid vector + lexical retrieval across knowledge-base partitions.
///
/// Each partition label maps to one search index; a partition is a
/// `(label, kb_id)` pair on that index.
pub struct RetrievalEngine {
    embedder: Arc<dyn TextEmbedder>,
    indexes: HashMap<String, Arc<dyn SearchIndex>>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn TextEmbedder>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            indexes: HashMap::new(),
            config,
        }
    }

    /// Serve every partition under `label` from `index`.
    pub fn with_index(mut self, label: impl Into<String>, index: Arc<dyn SearchIndex>) -> Self {
        self.indexes.insert(label.into(), index);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Search the configured partitions.
    pub async fn search(&self, query: &str) -> Result<Vec<RetrievalResult>, PravahError> {
        self.search_in(query, &[]).await
    }

    /// Search `partitions`, or the configured ones when the slice is empty.
    ///
    /// A partition that fails or exceeds the per-partition timeout contributes
    /// nothing; only when every partition fails is `RetrievalUnavailable` returned.
    pub async fn search_in(
        &self,
        query: &str,
        partitions: &[Partition],
    ) -> Result<Vec<RetrievalResult>, PravahError> {
        let partitions = if partitions.is_empty() {
            self.config.partitions.as_slice()
        } else {
            partitions
        };
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;
        let embedding = embedding.as_slice();

        let outcomes = join_all(partitions.iter().map(|partition| async move {
            let result = tokio::time::timeout(
                self.config.partition_timeout,
                self.query_partition(partition, embedding, query),
            )
            .await
            .unwrap_or_else(|_| {
                Err(PravahError::RetrievalPartition {
                    partition: partition.to_string(),
                    reason: format!("timed out after {:?}", self.config.partition_timeout),
                })
            });
            (partition, result)
        }))
        .await;

        let mut lists = Vec::with_capacity(outcomes.len());
        let mut failed = 0usize;
        for (partition, outcome) in outcomes {
            match outcome {
                Ok(results) => {
                    info!(partition = %partition, hits = results.len(), "Partition searched");
                    lists.push(results);
                }
                Err(e) => {
                    failed += 1;
                    warn!(partition = %partition, error = %e, "Partition search failed, degrading to empty");
                }
            }
        }
        if failed == partitions.len() {
            return Err(PravahError::RetrievalUnavailable(failed));
        }

        let merged = fusion::merge(lists);
        let unique = fusion::dedup_by_parent(merged);
        Ok(fusion::top_k(unique, self.config.top_k))
    }

    async fn query_partition(
        &self,
        partition: &Partition,
        embedding: &[f32],
        query: &str,
    ) -> Result<Vec<RetrievalResult>, PravahError> {
        let partition_err = |reason: String| PravahError::RetrievalPartition {
            partition: partition.to_string(),
            reason,
        };
        let index = self
            .indexes
            .get(&partition.label)
            .ok_or_else(|| partition_err(format!("no index registered for label '{}'", partition.label)))?;

        let n = self.config.candidates_per_query;
        let (vector_hits, lexical_hits) = tokio::join!(
            index.vector_query(partition, embedding, n, self.config.exact),
            index.lexical_query(partition, query, n),
        );
        let vector_hits = vector_hits.map_err(|e| partition_err(format!("vector query: {e}")))?;
        let lexical_hits = lexical_hits.map_err(|e| partition_err(format!("lexical query: {e}")))?;

        Ok(fusion::fuse_partition(
            partition,
            &vector_hits,
            &lexical_hits,
            &self.config,
        ))
    }

    /// Check every configured partition exists on its index.
    /// Returns the error list per label; an empty list means the label is healthy.
    pub async fn validate_partitions(&self) -> BTreeMap<String, Vec<String>> {
        let mut report: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for partition in &self.config.partitions {
            let errors = report.entry(partition.label.clone()).or_default();
            let Some(index) = self.indexes.get(&partition.label) else {
                errors.push(format!("no index registered for label '{}'", partition.label));
                continue;
            };
            match index.has_partition(partition).await {
                Ok(true) => {}
                Ok(false) => errors.push(format!(
                    "knowledge base '{}' not found under '{}'",
                    partition.kb_id, partition.label
                )),
                Err(e) => errors.push(format!("connection to '{}' failed: {e}", partition.label)),
            }
        }
        report
    }
}
