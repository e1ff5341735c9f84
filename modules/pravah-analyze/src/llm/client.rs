use anyhow::anyhow;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use tracing::debug;

use pravah_common::PravahError;

use super::types::*;

pub(crate) struct OpenAiClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str, http: reqwest::Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, PravahError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| PravahError::Config(format!("invalid API key header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Chat completion; returns the first choice's content.
    pub async fn chat(&self, request: &ChatRequest) -> Result<String, PravahError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, structured = request.response_format.is_some(), "LLM chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(PravahError::transient)?;

        let chat: ChatResponse = check_status(response, "chat")
            .await?
            .json()
            .await
            .map_err(PravahError::transient)?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PravahError::validation("LLM returned no choices"))
    }

    pub async fn embed(
        &self,
        model: &str,
        text: &str,
        dimensions: Option<usize>,
    ) -> Result<Vec<f32>, PravahError> {
        let url = format!("{}/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: model.to_string(),
            input: text.to_string(),
            dimensions,
        };

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(PravahError::transient)?;

        let embed: EmbeddingResponse = check_status(response, "embedding")
            .await?
            .json()
            .await
            .map_err(PravahError::transient)?;

        embed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| PravahError::validation("No embedding in response"))
    }
}

/// Rate limits and server errors are worth retrying; other failures are not.
async fn check_status(response: Response, what: &str) -> Result<Response, PravahError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if is_retryable(status) {
        Err(PravahError::transient(format!("LLM {what} error ({status}): {body}")))
    } else {
        Err(anyhow!("LLM {what} error ({status}): {body}").into())
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
