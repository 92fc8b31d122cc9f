use serde::{Deserialize, Serialize};

/// Lifecycle of one resume through the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStage {
    Queued,
    Processing,
    Completed,
    Error,
}

impl ResumeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeStage::Queued => "queued",
            ResumeStage::Processing => "processing",
            ResumeStage::Completed => "completed",
            ResumeStage::Error => "error",
        }
    }
}

/// State reported for a ranking task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingState {
    Processing,
    Completed,
    Failed,
}

/// Cached under `resume:processing:<resumeId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub task_id: String,
    pub status: ResumeStage,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

/// Values persisted in `jobs.ranking_status`.
pub mod job_ranking {
    pub const IN_PROGRESS: &str = "in_progress";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const NOT_STARTED: &str = "not_started";
}
