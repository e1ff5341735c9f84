//! Message bus seam. At-least-once delivery, no ordering guarantee.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use pravah_common::{PravahError, StageName};

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Hand `payload` to the bus for `topic`. Returns once the bus accepted it.
    async fn publish(&self, topic: StageName, payload: &Value) -> Result<(), PravahError>;
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Records every publish. Can be told to fail the next few calls.
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<(StageName, Value)>>,
    failures: Mutex<HashMap<StageName, u32>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes to `topic` with a transient error.
    pub async fn fail_next(&self, topic: StageName, count: u32) {
        self.failures.lock().await.insert(topic, count);
    }

    pub async fn published(&self, topic: StageName) -> Vec<Value> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: StageName, payload: &Value) -> Result<(), PravahError> {
        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(&topic).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(PravahError::transient(format!("{topic} publish refused")));
            }
        }
        self.published.lock().await.push((topic, payload.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP push
// ---------------------------------------------------------------------------

/// Delivers each topic by POSTing the payload to that topic's endpoint. A 2xx
/// means the endpoint accepted the message; processing happens after.
pub struct HttpPushBus {
    http: reqwest::Client,
    endpoints: HashMap<StageName, String>,
}

impl HttpPushBus {
    pub fn new(stage1_url: impl Into<String>, stage2_url: impl Into<String>) -> Result<Self, PravahError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PravahError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoints: HashMap::from([
                (StageName::Stage1, stage1_url.into()),
                (StageName::Stage2, stage2_url.into()),
            ]),
        })
    }
}

#[async_trait]
impl MessageBus for HttpPushBus {
    async fn publish(&self, topic: StageName, payload: &Value) -> Result<(), PravahError> {
        let url = self
            .endpoints
            .get(&topic)
            .ok_or_else(|| PravahError::Config(format!("no endpoint for topic {topic}")))?;

        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(PravahError::transient)?;

        let status = response.status();
        debug!(%topic, %status, "Pushed message");
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(PravahError::transient(format!("{topic} endpoint returned {status}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(PravahError::Validation(format!(
                "{topic} endpoint rejected message ({status}): {body}"
            )))
        }
    }
}
