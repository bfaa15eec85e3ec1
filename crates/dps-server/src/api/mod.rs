//! HTTP intake
//!
//! Thin producer for the inbound queue. Requests are validated against the
//! store, enqueued and acknowledged with `202 Accepted`; the actual work
//! happens in the inbound consumer.

pub mod response;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dps_common::Deposit;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::inbound::{InboundMessage, InboundSender};
use crate::middleware;
use crate::orchestrator::SubmissionRequest;
use crate::status::is_terminal;
use crate::store::DepositStore;
use response::ApiResponse;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DepositStore>,
    pub inbound: InboundSender,
    /// Checked by the health endpoint when present
    pub db: Option<PgPool>,
}

#[derive(Debug, Serialize)]
pub struct QueuedSubmission {
    pub submission_id: Uuid,
    pub repository_ids: Vec<String>,
    pub retry: bool,
}

#[derive(Debug, Serialize)]
pub struct QueuedRefresh {
    pub deposit: Deposit,
    /// False when the deposit is already terminal and nothing was enqueued
    pub queued: bool,
}

pub fn router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/submissions", post(create_submission))
        .route("/deposits/:id", get(get_deposit))
        .route("/deposits/:id/refresh", post(refresh_deposit));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .layer(middleware::tracing_layer())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let Some(db) = &state.db else {
        return (StatusCode::OK, Json(json!({ "status": "healthy" }))).into_response();
    };

    match sqlx::query("SELECT 1").fetch_one(db).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "unreachable"
                })),
            )
                .into_response()
        },
    }
}

async fn create_submission(
    State(state): State<AppState>,
    Json(request): Json<SubmissionRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<QueuedSubmission>>)> {
    if request.repository_ids.is_empty() {
        return Err(AppError::Validation("repository_ids must not be empty".to_string()));
    }

    let mut seen = HashSet::new();
    for repository_id in &request.repository_ids {
        if !seen.insert(repository_id.as_str()) {
            return Err(AppError::Validation(format!(
                "repository {} listed more than once",
                repository_id
            )));
        }
        state.store.load_repository_config(repository_id).await?;
    }

    let queued = QueuedSubmission {
        submission_id: request.submission_id,
        repository_ids: request.repository_ids.clone(),
        retry: request.retry,
    };

    state.inbound.enqueue(InboundMessage::Submit(request))?;
    info!(
        submission_id = %queued.submission_id,
        targets = queued.repository_ids.len(),
        retry = queued.retry,
        "Submission request queued"
    );

    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(queued))))
}

async fn get_deposit(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<ApiResponse<Deposit>> {
    let deposit = state
        .store
        .find_deposit(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Deposit {} not found", id)))?;

    Ok(ApiResponse::success(deposit))
}

async fn refresh_deposit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ApiResponse<QueuedRefresh>>)> {
    let deposit = state
        .store
        .find_deposit(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Deposit {} not found", id)))?;

    let terminal = is_terminal(Some(deposit.status)).map_err(|e| AppError::Internal(e.to_string()))?;
    if terminal {
        return Ok((
            StatusCode::OK,
            Json(ApiResponse::success(QueuedRefresh {
                deposit,
                queued: false,
            })),
        ));
    }

    state.inbound.enqueue(InboundMessage::Refresh { deposit_id: id })?;
    info!(deposit_id = %id, "Deposit refresh queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(QueuedRefresh {
            deposit,
            queued: true,
        })),
    ))
}
