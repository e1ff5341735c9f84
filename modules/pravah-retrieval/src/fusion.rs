//! Reciprocal rank fusion over the vector and lexical lists of one partition,
//! then the cross-partition merge. Pure functions.

use std::collections::{HashMap, HashSet};

use pravah_common::{Partition, RetrievalConfig, RetrievalResult};
use pravah_store::ScoredHit;

/// `1 / (rank + k + 1)` with a 0-based rank.
pub fn rrf(rank: usize, k: f64) -> f64 {
    1.0 / (rank as f64 + k + 1.0)
}

#[derive(Default)]
struct Joined {
    parent_id: Option<String>,
    text: String,
    vector_score: f64,
    vector_rrf: f64,
    lexical_score: f64,
    lexical_rrf: f64,
}

/// Outer-join both lists by record id, filter, fuse and cap one partition's hits.
///
/// A record survives the filter when either of its raw scores clears its
/// threshold; a side the record is missing from contributes 0.
pub fn fuse_partition(
    partition: &Partition,
    vector_hits: &[ScoredHit],
    lexical_hits: &[ScoredHit],
    config: &RetrievalConfig,
) -> Vec<RetrievalResult> {
    let mut order: Vec<String> = Vec::new();
    let mut joined: HashMap<String, Joined> = HashMap::new();

    for (rank, hit) in vector_hits.iter().enumerate() {
        let entry = joined.entry(hit.record_id.clone()).or_insert_with(|| {
            order.push(hit.record_id.clone());
            Joined {
                parent_id: hit.parent_id.clone(),
                text: hit.text.clone(),
                ..Joined::default()
            }
        });
        entry.vector_score = hit.score;
        entry.vector_rrf = rrf(rank, config.rrf_k);
    }
    for (rank, hit) in lexical_hits.iter().enumerate() {
        let entry = joined.entry(hit.record_id.clone()).or_insert_with(|| {
            order.push(hit.record_id.clone());
            Joined {
                parent_id: hit.parent_id.clone(),
                text: hit.text.clone(),
                ..Joined::default()
            }
        });
        entry.lexical_score = hit.score;
        entry.lexical_rrf = rrf(rank, config.rrf_k);
    }

    let vector_threshold = config.vector_threshold();
    let tag = partition.to_string();

    let mut fused: Vec<RetrievalResult> = order
        .into_iter()
        .filter_map(|id| joined.remove(&id).map(|j| (id, j)))
        .filter(|(_, j)| {
            j.lexical_score >= config.fts_threshold || j.vector_score >= vector_threshold
        })
        .map(|(record_id, j)| RetrievalResult {
            record_id,
            parent_id: j.parent_id,
            text: j.text,
            partition: tag.clone(),
            vector_score: j.vector_score,
            lexical_score: j.lexical_score,
            fused_score: config.alpha * j.vector_rrf + (1.0 - config.alpha) * j.lexical_rrf,
            rank: 0,
        })
        .collect();

    sort_by_fused(&mut fused);
    fused.truncate(config.per_partition_limit);
    fused
}

/// Descending fused score; ties keep a stable order by partition then record id.
fn sort_by_fused(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.partition.cmp(&b.partition))
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
}

/// Flatten per-partition lists and sort globally. A record reachable through
/// more than one partition is kept once, at its best score.
pub fn merge(lists: Vec<Vec<RetrievalResult>>) -> Vec<RetrievalResult> {
    let mut all: Vec<RetrievalResult> = lists.into_iter().flatten().collect();
    sort_by_fused(&mut all);
    let mut seen: HashSet<String> = HashSet::new();
    all.retain(|r| seen.insert(r.record_id.clone()));
    all
}

/// Keep the first (highest-scoring) result per parent chunk. Results without a
/// parent are always kept.
pub fn dedup_by_parent(results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    let mut seen: HashSet<String> = HashSet::new();
    results
        .into_iter()
        .filter(|r| match &r.parent_id {
            Some(parent) => seen.insert(parent.clone()),
            None => true,
        })
        .collect()
}

/// Truncate to `k` and stamp the final 0-based rank.
pub fn top_k(results: Vec<RetrievalResult>, k: usize) -> Vec<RetrievalResult> {
    results
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(rank, mut r)| {
            r.rank = rank;
            r
        })
        .collect()
}
