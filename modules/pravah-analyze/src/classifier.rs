use std::sync::Arc;

use tracing::{debug, info};

use pravah_common::{PairJudge, PravahError, RetrievalResult, Verdict};
use pravah_retrieval::RetrievalEngine;

/// Decision for one incoming item.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Already known; `matched_id` is the canonical record it repeats.
    Same { matched_id: String },
    /// Same event as `matched`, with new detail to merge in.
    Additional { matched: RetrievalResult },
    /// No candidate describes the same event.
    Different,
}

impl Classification {
    pub fn verdict(&self) -> Verdict {
        match self {
            Classification::Same { .. } => Verdict::Same,
            Classification::Additional { .. } => Verdict::Additional,
            Classification::Different => Verdict::Different,
        }
    }
}

/// Retrieval-backed, judge-adjudicated duplicate detection.
pub struct Classifier {
    engine: Arc<RetrievalEngine>,
    judge: Arc<dyn PairJudge>,
}

impl Classifier {
    pub fn new(engine: Arc<RetrievalEngine>, judge: Arc<dyn PairJudge>) -> Self {
        Self { engine, judge }
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    /// Retrieve candidates for `text` and classify against them.
    pub async fn classify(&self, text: &str) -> Result<Classification, PravahError> {
        let candidates = self.engine.search(text).await?;
        info!(candidates = candidates.len(), "Retrieved dedup candidates");
        self.classify_against(text, &candidates).await
    }

    /// Judge `text` against `candidates` in the given order, one judge call per
    /// candidate, stopping at the first `same` or `additional`.
    pub async fn classify_against(
        &self,
        text: &str,
        candidates: &[RetrievalResult],
    ) -> Result<Classification, PravahError> {
        for candidate in candidates {
            let verdict = self.judge.classify(&candidate.text, text).await?;
            debug!(
                record_id = %candidate.record_id,
                rank = candidate.rank,
                fused_score = candidate.fused_score,
                %verdict,
                "Candidate judged"
            );
            match verdict {
                Verdict::Same => {
                    return Ok(Classification::Same {
                        matched_id: candidate.record_id.clone(),
                    })
                }
                Verdict::Additional => {
                    return Ok(Classification::Additional {
                        matched: candidate.clone(),
                    })
                }
                Verdict::Different => {}
            }
        }
        Ok(Classification::Different)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pravah_common::RetrievalConfig;

    use crate::testing::{FixedEmbedder, ScriptedJudge};

    fn candidate(id: &str, rank: usize) -> RetrievalResult {
        RetrievalResult {
            record_id: id.to_string(),
            parent_id: None,
            text: format!("stored {id}"),
            partition: "primary.analyzed-events".to_string(),
            vector_score: 0.9,
            lexical_score: 2.0,
            fused_score: 0.016 - rank as f64 * 0.001,
            rank,
        }
    }

    fn classifier(judge: Arc<ScriptedJudge>) -> Classifier {
        let engine = RetrievalEngine::new(Arc::new(FixedEmbedder::new(8)), RetrievalConfig::default());
        Classifier::new(Arc::new(engine), judge)
    }

    #[tokio::test]
    async fn short_circuits_on_first_same() {
        let judge = Arc::new(
            ScriptedJudge::new()
                .on_pair("stored a", Verdict::Different)
                .on_pair("stored b", Verdict::Same)
                .on_pair("stored c", Verdict::Additional),
        );
        let candidates = [candidate("a", 0), candidate("b", 1), candidate("c", 2)];

        let result = classifier(judge.clone())
            .classify_against("incoming", &candidates)
            .await
            .unwrap();

        assert_eq!(result, Classification::Same { matched_id: "b".into() });
        assert_eq!(judge.calls(), vec!["stored a", "stored b"], "c is never judged");
    }

    #[tokio::test]
    async fn first_additional_wins_over_later_same() {
        let judge = Arc::new(
            ScriptedJudge::new()
                .on_pair("stored a", Verdict::Additional)
                .on_pair("stored b", Verdict::Same),
        );
        let candidates = [candidate("a", 0), candidate("b", 1)];

        let result = classifier(judge.clone())
            .classify_against("incoming", &candidates)
            .await
            .unwrap();

        assert_eq!(result.verdict(), Verdict::Additional);
        assert_eq!(judge.calls().len(), 1);
    }

    #[tokio::test]
    async fn judges_each_candidate_once_before_different() {
        let judge = Arc::new(ScriptedJudge::new());
        let candidates = [candidate("a", 0), candidate("b", 1), candidate("c", 2)];

        let result = classifier(judge.clone())
            .classify_against("incoming", &candidates)
            .await
            .unwrap();

        assert_eq!(result, Classification::Different);
        assert_eq!(judge.calls(), vec!["stored a", "stored b", "stored c"]);
    }

    #[tokio::test]
    async fn no_candidates_is_different() {
        let judge = Arc::new(ScriptedJudge::new());
        let result = classifier(judge.clone())
            .classify_against("incoming", &[])
            .await
            .unwrap();
        assert_eq!(result, Classification::Different);
        assert!(judge.calls().is_empty());
    }
}
