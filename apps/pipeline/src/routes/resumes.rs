//! Axum route handlers for resume ingestion.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::requests::{self, ResumeStatusView};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResumeRequest {
    pub job_id: String,
    pub applicant_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResumeResponse {
    pub task_id: String,
    pub resume_id: String,
    pub already_processed: bool,
}

/// POST /api/v1/resumes/:id/process
pub async fn handle_queue_resume(
    State(state): State<AppState>,
    Path(resume_id): Path<String>,
    Json(request): Json<QueueResumeRequest>,
) -> Result<(StatusCode, Json<QueueResumeResponse>), AppError> {
    if request.job_id.trim().is_empty() {
        return Err(AppError::Validation("jobId cannot be empty".to_string()));
    }

    let queued =
        requests::queue_resume(&state, &request.job_id, &request.applicant_id, &resume_id).await?;

    let status = if queued.already_processed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(QueueResumeResponse {
            task_id: queued.task_id,
            resume_id,
            already_processed: queued.already_processed,
        }),
    ))
}

/// GET /api/v1/resumes/:id/processing-status
pub async fn handle_processing_status(
    State(state): State<AppState>,
    Path(resume_id): Path<String>,
) -> Result<Json<ResumeStatusView>, AppError> {
    Ok(Json(requests::resume_status(&state, &resume_id).await?))
}
