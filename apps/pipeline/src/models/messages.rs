use serde::{Deserialize, Serialize};

use crate::models::status::{ProcessingStatus, RankingState};

/// Sentinel applicant id used when a resume was uploaded outside any application.
pub const DIRECT_UPLOAD_APPLICANT: &str = "direct-upload";

/// One resume ingestion event on the `resume-processing` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeProcessingMessage {
    pub task_id: String,
    pub resume_id: String,
    pub file_name: String,
    pub job_id: String,
    pub applicant_id: String,
    pub candidate_id: String,
    pub priority: u8,
    /// Enqueue time, epoch milliseconds.
    pub timestamp: i64,
}

impl ResumeProcessingMessage {
    pub fn is_direct_upload(&self) -> bool {
        self.applicant_id == DIRECT_UPLOAD_APPLICANT
    }
}

/// Request to rank a job's entire applicant pool, on the `resume-ranking` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingJobMessage {
    pub task_id: String,
    pub job_id: String,
    pub recruiter_id: String,
    pub total_applicants: u64,
    #[serde(default)]
    pub force_refresh: bool,
    pub timestamp: i64,
}

/// Progress snapshot of a ranking task. Cached under `ranking:job:<jobId>:status`
/// and published to the `ranking-status` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateMessage {
    pub task_id: String,
    pub job_id: String,
    pub status: RankingState,
    pub processed: u64,
    pub total: u64,
    pub progress: u8,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdateMessage {
    /// Builds an update, clamping `processed` to `total` and deriving the
    /// rounded percentage.
    pub fn progress_of(
        task_id: &str,
        job_id: &str,
        status: RankingState,
        processed: u64,
        total: u64,
        timestamp: i64,
    ) -> Self {
        let processed = processed.min(total);
        let progress = match status {
            RankingState::Completed => 100,
            _ if total == 0 => 0,
            _ => ((processed as f64 / total as f64) * 100.0).round() as u8,
        };
        Self {
            task_id: task_id.to_string(),
            job_id: job_id.to_string(),
            status,
            processed,
            total,
            progress,
            timestamp,
            error: None,
        }
    }
}

/// Resume progress as published on the `resume-status` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeStatusMessage {
    pub resume_id: String,
    #[serde(flatten)]
    pub status: ProcessingStatus,
}
