//! One OpenAI-compatible HTTP client serving the embedder, the pair judge and
//! the item analyzer.

mod client;
pub mod prompts;
pub mod schema;
pub(crate) mod types;

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::debug;

use pravah_common::{
    retry_transient, Analysis, CandidateRecord, ItemAnalyzer, LlmConfig, PairJudge, PravahError,
    RetryPolicy, TextEmbedder, Verdict,
};

use client::OpenAiClient;
pub use schema::StructuredOutput;
use types::{ChatRequest, WireMessage};

/// Structured reply of the pair judge.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct JudgeReply {
    /// How text2 relates to text1
    pub verdict: Verdict,
}

pub struct OpenAi {
    client: OpenAiClient,
    judge_model: String,
    embedding_model: String,
    dimensions: usize,
    retry: RetryPolicy,
}

impl OpenAi {
    pub fn new(config: &LlmConfig) -> Result<Self, PravahError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PravahError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client: OpenAiClient::new(&config.api_key, &config.base_url, http),
            judge_model: config.judge_model.clone(),
            embedding_model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Structured output validated against `T`'s schema. A reply that does not
    /// parse is a validation error and is not retried.
    async fn extract<T: StructuredOutput>(&self, system: &str, user: String) -> Result<T, PravahError> {
        let request = ChatRequest::new(&self.judge_model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user))
            .json_schema(&T::output_name(), T::strict_schema());

        let raw = retry_transient(&self.retry, "llm structured output", || {
            self.client.chat(&request)
        })
        .await?;

        serde_json::from_str(strip_code_blocks(&raw)).map_err(|e| {
            PravahError::Validation(format!("{} reply failed schema validation: {e}", T::output_name()))
        })
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, PravahError> {
        let request = ChatRequest::new(&self.judge_model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user));

        retry_transient(&self.retry, "llm completion", || self.client.chat(&request)).await
    }
}

#[async_trait]
impl TextEmbedder for OpenAi {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PravahError> {
        let embedding = retry_transient(&self.retry, "embedding", || {
            self.client
                .embed(&self.embedding_model, text, Some(self.dimensions))
        })
        .await?;

        if embedding.len() != self.dimensions {
            return Err(PravahError::Validation(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimensions
            )));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl PairJudge for OpenAi {
    async fn classify(&self, existing: &str, incoming: &str) -> Result<Verdict, PravahError> {
        let reply: JudgeReply = self
            .extract(prompts::JUDGE_SYSTEM, prompts::judge_user(existing, incoming))
            .await?;
        debug!(verdict = %reply.verdict, "Pair judged");
        Ok(reply.verdict)
    }

    async fn merge(&self, existing: &str, incoming: &str) -> Result<String, PravahError> {
        let combined = self
            .complete(prompts::MERGE_SYSTEM, prompts::merge_user(existing, incoming))
            .await?;
        let combined = strip_code_blocks(&combined).to_string();
        if combined.is_empty() {
            return Err(PravahError::validation("merge returned empty text"));
        }
        Ok(combined)
    }
}

#[async_trait]
impl ItemAnalyzer for OpenAi {
    async fn analyze(&self, item: &CandidateRecord) -> Result<Analysis, PravahError> {
        let analysis: Analysis = self
            .extract(prompts::ANALYZE_SYSTEM, prompts::analyze_user(item))
            .await?;
        if analysis.text.trim().is_empty() {
            return Err(PravahError::Validation(format!(
                "analysis of {} has empty text",
                item.source_id
            )));
        }
        Ok(analysis)
    }
}

/// Strip a markdown code fence some models wrap around their reply.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
