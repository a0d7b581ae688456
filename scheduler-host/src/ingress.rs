//! The HTTP ingress surface (spec §6 "Ingress protocol"). Grounded on the
//! teacher's `server::api` handlers (plain `axum` extractors, a typed error
//! that implements `IntoResponse`) and `server::api::metrics` for the
//! `/metrics` route.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use scheduler_core::{NewTask, Params, SchedulerResult, SqliteStore, TaskStore, Transaction};
use serde::Deserialize;

const INGRESS_BEGIN_DEADLINE: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
}

/// What a producer posts (spec §6): `{method, params, at}`, `at` as RFC3339.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub method: String,
    #[serde(default)]
    pub params: Params,
    pub at: DateTime<Utc>,
}

pub enum IngressError {
    InvalidRequest(String),
    Internal(scheduler_core::SchedulerError),
}

impl From<scheduler_core::SchedulerError> for IngressError {
    fn from(e: scheduler_core::SchedulerError) -> Self {
        IngressError::Internal(e)
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            IngressError::InvalidRequest(e) => (StatusCode::BAD_REQUEST, e),
            IngressError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// `POST /tasks`. Malformed requests (missing `method`, unparsable `at`)
/// never reach the store — `axum`'s JSON extractor rejects those before the
/// handler body runs, satisfying spec §6's "never persisted" requirement.
async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<StatusCode, IngressError> {
    if request.method.trim().is_empty() {
        return Err(IngressError::InvalidRequest("method must not be empty".to_string()));
    }

    let mut txn = state.store.begin(INGRESS_BEGIN_DEADLINE).await?;
    txn.insert_task(NewTask {
        method: request.method,
        params: request.params,
        at: request.at,
    })
    .await?;
    txn.commit().await?;

    Ok(StatusCode::ACCEPTED)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics() -> SchedulerResult<Response> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let families = prometheus::gather();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| scheduler_core::SchedulerError::Other(e.to_string()))?;
    Ok(Response::builder()
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
        .expect("static response is well-formed"))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
        }
    }

    #[tokio::test]
    async fn accepts_a_well_formed_submission() {
        let app = router(test_state());
        let body = serde_json::json!({
            "method": "notify",
            "params": {"name": "a"},
            "at": "2024-01-01T10:00:00Z",
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn rejects_missing_at() {
        let app = router(test_state());
        let body = serde_json::json!({ "method": "notify", "params": {} });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
