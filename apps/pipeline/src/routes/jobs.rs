//! Axum route handlers for the Ranking API.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::requests::{self, RankRequest, RankingRequestOutcome, RankingStatusView};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankCandidatesRequest {
    pub recruiter_id: String,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingStatusQuery {
    pub task_id: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/jobs/:id/rank
///
/// Queues a ranking run for the job's applicant pool unless one is already
/// running or fresh cached results exist (bypassed by `forceRefresh`).
pub async fn handle_rank_candidates(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<RankCandidatesRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if request.recruiter_id.trim().is_empty() {
        return Err(AppError::Validation("recruiterId cannot be empty".to_string()));
    }

    let outcome = requests::request_ranking(
        &state,
        &job_id,
        &RankRequest {
            recruiter_id: request.recruiter_id,
            force_refresh: request.force_refresh,
        },
    )
    .await?;

    let (status, body) = match outcome {
        RankingRequestOutcome::AlreadyRunning(status) => (
            StatusCode::ACCEPTED,
            merged(
                &status,
                json!({ "message": "Ranking already in progress", "alreadyInProgress": true }),
            )?,
        ),
        RankingRequestOutcome::CacheHit(entry) => (
            StatusCode::OK,
            merged(
                &entry,
                json!({ "message": "Candidates ranked successfully (cached)", "cacheHit": true }),
            )?,
        ),
        RankingRequestOutcome::NoApplicants => (
            StatusCode::OK,
            json!({
                "message": "No applicants found for this job",
                "candidates": [],
                "total": 0,
                "processed": 0
            }),
        ),
        RankingRequestOutcome::Accepted {
            task_id,
            total,
            priority,
            timestamp,
        } => (
            StatusCode::ACCEPTED,
            json!({
                "message": "Ranking process started",
                "taskId": task_id,
                "jobId": job_id,
                "total": total,
                "priority": priority,
                "status": "processing",
                "timestamp": timestamp
            }),
        ),
    };

    Ok((status, Json(body)))
}

/// GET /api/v1/jobs/:id/ranking-status?taskId=
pub async fn handle_ranking_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<RankingStatusQuery>,
) -> Result<Json<RankingStatusView>, AppError> {
    let view = requests::ranking_status(&state, &job_id, query.task_id.as_deref()).await?;
    Ok(Json(view))
}

/// Serializes `base` and adds the fields of `extra` on top.
fn merged<T: Serialize>(base: &T, extra: Value) -> Result<Value, AppError> {
    let mut value = serde_json::to_value(base).map_err(|e| AppError::Internal(e.into()))?;
    if let (Value::Object(target), Value::Object(fields)) = (&mut value, extra) {
        target.extend(fields);
    }
    Ok(value)
}
