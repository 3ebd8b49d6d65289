//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, TollgateError>` so errors map
//! to HTTP status codes through `TollgateError`'s `IntoResponse`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::error::TollgateError;
use crate::jobs::{Job, JobId, JobOptions, NewJob};

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn queue_health(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.health().await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "queues": report.queues,
                "timestamp": report.checked_at.to_rfc3339(),
            })),
        ),
        Err(e) => {
            e.log();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "error": e.user_message(),
                })),
            )
        }
    }
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Deserialize)]
pub struct BulkEnqueueRequest {
    pub jobs: Vec<EnqueueRequest>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: JobId,
    pub queue: String,
}

/// One entry of a bulk enqueue: an id, or the reason the job was refused.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BulkItem {
    Enqueued {
        id: JobId,
    },
    Rejected {
        error: String,
        error_code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct BulkEnqueueResponse {
    pub enqueued: usize,
    pub rejected: usize,
    pub results: Vec<BulkItem>,
}

pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, TollgateError> {
    let id = state.queue.enqueue(&queue, req.payload, req.options).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(EnqueueResponse { id, queue })),
    ))
}

pub async fn enqueue_bulk(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<BulkEnqueueRequest>,
) -> Result<impl IntoResponse, TollgateError> {
    if req.jobs.is_empty() {
        return Err(TollgateError::validation("jobs", "at least one job is required"));
    }

    let jobs = req
        .jobs
        .into_iter()
        .map(|j| NewJob::new(queue.clone(), j.payload).with_options(j.options))
        .collect();

    let results: Vec<BulkItem> = state
        .queue
        .enqueue_bulk(jobs)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(id) => BulkItem::Enqueued { id },
            Err(e) => BulkItem::Rejected {
                error: e.user_message().to_string(),
                error_code: e.code().to_string(),
                field: e.field().map(str::to_string),
            },
        })
        .collect();

    let enqueued = results
        .iter()
        .filter(|r| matches!(r, BulkItem::Enqueued { .. }))
        .count();

    Ok(Json(ApiResponse::success(BulkEnqueueResponse {
        enqueued,
        rejected: results.len() - enqueued,
        results,
    })))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Job>>, TollgateError> {
    let id: JobId = id.parse()?;
    let job = state.queue.require(id).await?;
    Ok(Json(ApiResponse::success(job)))
}

pub async fn remove_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, TollgateError> {
    let id: JobId = id.parse()?;
    if !state.queue.remove(id).await? {
        return Err(TollgateError::job_not_found(id));
    }
    Ok(Json(ApiResponse::success(serde_json::json!({
        "id": id,
        "removed": true,
    }))))
}
