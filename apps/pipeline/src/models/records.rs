//! Projections of the document-store records the pipeline reads.
//! Only the fields the pipeline touches are modelled here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResumeRecord {
    pub id: String,
    pub candidate_id: String,
    pub file_name: String,
    pub file_path: Option<String>,
    pub processing_status: Option<String>,
    pub parsed_data: Option<Value>,
    pub processing_error: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ResumeRecord {
    pub fn is_completed(&self) -> bool {
        self.processing_status.as_deref() == Some("completed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub skills: Vec<String>,
    pub ranking_status: Option<String>,
    pub ranking_task_id: Option<String>,
    pub ranking_error: Option<String>,
    pub ranking_started_at: Option<DateTime<Utc>>,
    pub ranking_completed_at: Option<DateTime<Utc>>,
}

/// An applicant joined with its candidate and resume projections.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApplicantForRanking {
    pub applicant_id: String,
    pub candidate_id: String,
    pub candidate_name: Option<String>,
    pub candidate_skills: Vec<String>,
    pub candidate_experience: Option<String>,
    pub resume_id: Option<String>,
    pub resume_file_name: Option<String>,
    pub resume_parsed_data: Option<Value>,
}

/// Outcome written back to a resume at the end of processing.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOutcome {
    pub status: &'static str,
    pub parsed_data: Option<Value>,
    pub processing_error: Option<String>,
}

/// Renders stored parsed data as plain text for a ranking request.
pub fn parsed_data_text(parsed: Option<&Value>) -> String {
    match parsed {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
