use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::synthesis::{parse_batch_envelope, Stage2Worker};
use crate::worker::{parse_envelope, EnvelopeError, Stage1Worker};

#[derive(Clone)]
struct AppState {
    stage1: Arc<Stage1Worker>,
    stage2: Arc<Stage2Worker>,
}

pub fn build_router(stage1: Arc<Stage1Worker>, stage2: Arc<Stage2Worker>) -> Router {
    Router::new()
        .route("/", post(receive_stage1))
        .route("/stage2", post(receive_stage2))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { stage1, stage2 })
}

async fn health() -> &'static str {
    "pravah-analyze is running"
}

/// Push endpoint for stage-1 messages. A valid envelope is accepted with a 202
/// and processed in the background; the ack goes to the orchestrator when the
/// item is done. Malformed envelopes get a 400 and are never acknowledged.
async fn receive_stage1(State(state): State<AppState>, body: Bytes) -> Response {
    let envelope = match parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(e) => return rejected("stage-1", e),
    };

    let correlation_id = envelope.correlation_id.clone();
    tokio::spawn(async move {
        let correlation_id = envelope.correlation_id.clone();
        if let Err(e) = state.stage1.process_message(envelope).await {
            warn!(%correlation_id, error = %e, "Stage-1 message left unacknowledged");
        }
    });
    accepted(correlation_id)
}

/// Push endpoint for stage-2 batches. Same hand-off as stage 1.
async fn receive_stage2(State(state): State<AppState>, body: Bytes) -> Response {
    let envelope = match parse_batch_envelope(&body) {
        Ok(envelope) => envelope,
        Err(e) => return rejected("stage-2", e),
    };

    let correlation_id = envelope.correlation_id.clone();
    tokio::spawn(async move {
        let job_id = envelope.job_id.clone();
        if let Err(e) = state.stage2.process_message(envelope).await {
            warn!(%job_id, error = %e, "Stage-2 batch left unacknowledged");
        }
    });
    accepted(correlation_id)
}

fn accepted(correlation_id: String) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "correlation_id": correlation_id })),
    )
        .into_response()
}

fn rejected(stage: &str, err: EnvelopeError) -> Response {
    warn!(stage, error = %err, "Rejected message");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
}
