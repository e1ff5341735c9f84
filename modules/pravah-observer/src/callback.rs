use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use pravah_common::{Callback, PravahError};

use crate::orchestrator::Orchestrator;

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/callback", post(callback))
        .route("/jobs/{job_id}", get(job_status))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn health() -> &'static str {
    "pravah-observer is running"
}

/// Worker acknowledgments. Duplicates are a 200 with `"status": "duplicate"`.
async fn callback(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(callback): Json<Callback>,
) -> Response {
    match orchestrator.handle_callback(&callback).await {
        Ok(status) => (StatusCode::OK, Json(json!({ "status": status }))).into_response(),
        Err(e) => {
            warn!(
                job_id = %callback.job_id,
                correlation_id = %callback.correlation_id,
                error = %e,
                "Callback rejected"
            );
            error_response(e)
        }
    }
}

async fn job_status(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.status(&job_id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: PravahError) -> Response {
    let (status, message) = match &err {
        PravahError::UnknownJob(_) => (StatusCode::NOT_FOUND, "unknown job".to_string()),
        PravahError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    };
    (status, Json(json!({ "error": message }))).into_response()
}
