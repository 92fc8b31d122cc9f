//! Caller-facing entry points: queueing work and polling its progress.
//!
//! The status cache doubles as an advisory lock here. Two requests racing
//! past the in-progress check both enqueue a run; the runs are idempotent
//! and the later one simply overwrites the cached results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::broker::{publish_json, RANKING_QUEUE, RESUME_PROCESSING_QUEUE};
use crate::errors::AppError;
use crate::models::messages::{
    RankingJobMessage, ResumeProcessingMessage, StatusUpdateMessage, DIRECT_UPLOAD_APPLICANT,
};
use crate::models::ranking::RankingResultsEntry;
use crate::models::status::{job_ranking, ProcessingStatus, RankingState, ResumeStage};
use crate::pipeline::now_ms;
use crate::priority::Priority;
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Resume processing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedResume {
    pub task_id: String,
    pub already_processed: bool,
}

/// Queues a resume for ingestion at normal priority. A resume that already
/// completed is not queued again; its applicant is marked processed instead.
pub async fn queue_resume(
    state: &AppState,
    job_id: &str,
    applicant_id: &str,
    resume_id: &str,
) -> Result<QueuedResume, AppError> {
    let resume = state
        .store
        .find_resume(resume_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resume {resume_id} not found")))?;

    if resume.is_completed() {
        info!("Resume {resume_id} already processed, skipping processing");
        if !applicant_id.is_empty() && applicant_id != DIRECT_UPLOAD_APPLICANT {
            state
                .store
                .mark_applicant_resume_processed(applicant_id, Utc::now())
                .await?;
        }
        let task_id = match state.cache.resume_status(resume_id).await? {
            Some(status) => status.task_id,
            None => Uuid::new_v4().to_string(),
        };
        return Ok(QueuedResume {
            task_id,
            already_processed: true,
        });
    }

    let task_id = Uuid::new_v4().to_string();
    let now = now_ms();

    state.store.mark_resume_queued(resume_id).await?;
    state
        .cache
        .set_resume_status(
            resume_id,
            &ProcessingStatus {
                task_id: task_id.clone(),
                status: ResumeStage::Queued,
                progress: 0,
                error: None,
                timestamp: now,
            },
        )
        .await?;

    let priority = Priority::Normal.value();
    let message = ResumeProcessingMessage {
        task_id: task_id.clone(),
        resume_id: resume_id.to_string(),
        file_name: resume.file_name,
        job_id: job_id.to_string(),
        applicant_id: applicant_id.to_string(),
        candidate_id: resume.candidate_id,
        priority,
        timestamp: now,
    };
    publish_json(state.publisher.as_ref(), RESUME_PROCESSING_QUEUE, &message, priority).await?;

    info!("Resume {resume_id} queued for processing (task: {task_id})");
    Ok(QueuedResume {
        task_id,
        already_processed: false,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResumeStatusView {
    Live(ProcessingStatus),
    Stored {
        status: String,
        progress: u8,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Live status from the cache, else whatever the resume record says.
pub async fn resume_status(state: &AppState, resume_id: &str) -> Result<ResumeStatusView, AppError> {
    if let Some(status) = state.cache.resume_status(resume_id).await? {
        return Ok(ResumeStatusView::Live(status));
    }

    let resume = state
        .store
        .find_resume(resume_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resume {resume_id} not found")))?;

    let completed = resume.is_completed();
    Ok(ResumeStatusView::Stored {
        status: resume
            .processing_status
            .unwrap_or_else(|| "unknown".to_string()),
        progress: if completed { 100 } else { 0 },
        timestamp: resume
            .last_modified
            .map(|at| at.timestamp_millis())
            .unwrap_or_else(now_ms),
        error: resume.processing_error,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Ranking
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RankRequest {
    pub recruiter_id: String,
    pub force_refresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RankingRequestOutcome {
    /// A run is already in progress; its latest status.
    AlreadyRunning(StatusUpdateMessage),
    /// Results younger than the freshness window.
    CacheHit(RankingResultsEntry),
    NoApplicants,
    Accepted {
        task_id: String,
        total: u64,
        priority: u8,
        timestamp: i64,
    },
}

pub async fn request_ranking(
    state: &AppState,
    job_id: &str,
    request: &RankRequest,
) -> Result<RankingRequestOutcome, AppError> {
    request_ranking_at(state, job_id, request, now_ms()).await
}

/// `request_ranking` with an explicit clock, epoch milliseconds.
pub async fn request_ranking_at(
    state: &AppState,
    job_id: &str,
    request: &RankRequest,
    now: i64,
) -> Result<RankingRequestOutcome, AppError> {
    if !request.force_refresh {
        if let Some(status) = state.cache.ranking_status(job_id).await? {
            if status.status == RankingState::Processing {
                return Ok(RankingRequestOutcome::AlreadyRunning(status));
            }
        }

        if let Some(entry) = state.cache.ranking_results(job_id).await? {
            let max_age_ms = state.results_freshness.as_millis() as i64;
            if entry.is_fresh_at(now, max_age_ms) {
                info!("Serving cached ranking for job {job_id}");
                return Ok(RankingRequestOutcome::CacheHit(entry));
            }
            // Past the freshness window the entry is never served again.
            state.cache.evict_ranking_results(job_id).await?;
        }
    }

    let job = state
        .store
        .find_job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;

    let total = state.store.count_applicants(&job.id).await?;
    if total == 0 {
        return Ok(RankingRequestOutcome::NoApplicants);
    }

    let task_id = Uuid::new_v4().to_string();
    let started_at = DateTime::<Utc>::from_timestamp_millis(now).unwrap_or_else(Utc::now);
    state
        .store
        .mark_job_ranking_started(&job.id, &task_id, started_at)
        .await?;
    state
        .cache
        .set_ranking_status(&StatusUpdateMessage::progress_of(
            &task_id,
            &job.id,
            RankingState::Processing,
            0,
            total,
            now,
        ))
        .await?;

    let priority = Priority::for_applicant_count(total).value();
    let message = RankingJobMessage {
        task_id: task_id.clone(),
        job_id: job.id.clone(),
        recruiter_id: request.recruiter_id.clone(),
        total_applicants: total,
        force_refresh: request.force_refresh,
        timestamp: now,
    };
    publish_json(state.publisher.as_ref(), RANKING_QUEUE, &message, priority).await?;

    info!("Ranking task {task_id} queued for job {job_id} ({total} applicants, priority {priority})");
    Ok(RankingRequestOutcome::Accepted {
        task_id,
        total,
        priority,
        timestamp: now,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RankingStatusView {
    Live(StatusUpdateMessage),
    #[serde(rename_all = "camelCase")]
    Derived {
        job_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_ranked_at: Option<DateTime<Utc>>,
        total: u64,
        processed: u64,
        progress: u8,
        has_cached_results: bool,
        timestamp: i64,
    },
}

/// Cached progress of the job's ranking task. With `task_id`, only that
/// task's status is returned. Without any cached status the view is derived
/// from the document store.
pub async fn ranking_status(
    state: &AppState,
    job_id: &str,
    task_id: Option<&str>,
) -> Result<RankingStatusView, AppError> {
    let job = state
        .store
        .find_job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;

    let cached = state.cache.ranking_status(job_id).await?;
    if let Some(task_id) = task_id {
        return match cached {
            Some(status) if status.task_id == task_id => Ok(RankingStatusView::Live(status)),
            _ => Err(AppError::NotFound(format!("Task {task_id} not found"))),
        };
    }
    if let Some(status) = cached {
        return Ok(RankingStatusView::Live(status));
    }

    let total = state.store.count_applicants(job_id).await?;
    let processed = state.store.count_ranked_applicants(job_id).await?.min(total);
    let progress = if total > 0 {
        ((processed as f64 / total as f64) * 100.0).round() as u8
    } else {
        0
    };

    Ok(RankingStatusView::Derived {
        job_id: job.id,
        status: job
            .ranking_status
            .unwrap_or_else(|| job_ranking::NOT_STARTED.to_string()),
        last_ranked_at: job.ranking_completed_at,
        total,
        processed,
        progress,
        has_cached_results: state.cache.has_ranking_results(job_id).await?,
        timestamp: now_ms(),
    })
}
