//! Document-store access for the pipeline: resumes, applicants and jobs.
//!
//! Only the fields the pipeline owns are written. Everything else on these
//! records belongs to the recruiting application and is left untouched.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

use crate::models::ranking::ApplicantScoreUpdate;
use crate::models::records::{ApplicantForRanking, JobRecord, ResumeOutcome, ResumeRecord};
use crate::models::status::job_ranking;

#[async_trait]
pub trait RecruitingStore: Send + Sync {
    async fn find_resume(&self, resume_id: &str) -> Result<Option<ResumeRecord>>;
    async fn mark_resume_queued(&self, resume_id: &str) -> Result<()>;
    async fn save_resume_outcome(&self, resume_id: &str, outcome: &ResumeOutcome) -> Result<()>;

    /// Sets `resume_processed` on the applicant. Returns false when it was already set.
    async fn mark_applicant_resume_processed(
        &self,
        applicant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn update_applicant_scores(
        &self,
        applicant_id: &str,
        update: &ApplicantScoreUpdate,
    ) -> Result<()>;
    async fn count_applicants(&self, job_id: &str) -> Result<u64>;
    async fn count_ranked_applicants(&self, job_id: &str) -> Result<u64>;

    /// One page of a job's applicants joined with candidate and resume projections,
    /// in a stable order.
    async fn applicants_page(
        &self,
        job_id: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<ApplicantForRanking>>;

    async fn find_job(&self, job_id: &str) -> Result<Option<JobRecord>>;
    async fn mark_job_ranking_started(
        &self,
        job_id: &str,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn mark_job_ranking_completed(&self, job_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn mark_job_ranking_failed(&self, job_id: &str, error: &str) -> Result<()>;
}

pub struct PgRecruitingStore {
    pool: PgPool,
}

impl PgRecruitingStore {
    /// Creates the PostgreSQL connection pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecruitingStore for PgRecruitingStore {
    async fn find_resume(&self, resume_id: &str) -> Result<Option<ResumeRecord>> {
        Ok(sqlx::query_as::<_, ResumeRecord>(
            r#"
            SELECT id, candidate_id, file_name, file_path, processing_status,
                   parsed_data, processing_error, last_modified
            FROM resumes
            WHERE id = $1
            "#,
        )
        .bind(resume_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_resume_queued(&self, resume_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE resumes SET processing_status = 'queued', last_modified = NOW() WHERE id = $1",
        )
        .bind(resume_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_resume_outcome(&self, resume_id: &str, outcome: &ResumeOutcome) -> Result<()> {
        // A failed run keeps whatever parsed data an earlier run stored.
        sqlx::query(
            r#"
            UPDATE resumes
            SET status = $2,
                processing_status = $2,
                parsed_data = COALESCE($3, parsed_data),
                processing_error = $4,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(resume_id)
        .bind(outcome.status)
        .bind(outcome.parsed_data.as_ref())
        .bind(outcome.processing_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_applicant_resume_processed(
        &self,
        applicant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE applicants
            SET resume_processed = TRUE, resume_processed_at = $2
            WHERE id = $1 AND resume_processed IS NOT TRUE
            "#,
        )
        .bind(applicant_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_applicant_scores(
        &self,
        applicant_id: &str,
        update: &ApplicantScoreUpdate,
    ) -> Result<()> {
        sqlx::query("UPDATE applicants SET job_fit_score = $2, ai_analysis = $3 WHERE id = $1")
            .bind(applicant_id)
            .bind(update.job_fit_score)
            .bind(Json(&update.ai_analysis))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_applicants(&self, job_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM applicants WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_ranked_applicants(&self, job_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM applicants WHERE job_id = $1 AND job_fit_score > 0",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn applicants_page(
        &self,
        job_id: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<ApplicantForRanking>> {
        Ok(sqlx::query_as::<_, ApplicantForRanking>(
            r#"
            SELECT a.id AS applicant_id,
                   a.candidate_id AS candidate_id,
                   c.full_name AS candidate_name,
                   COALESCE(c.skills, '{}') AS candidate_skills,
                   c.experience AS candidate_experience,
                   r.id AS resume_id,
                   r.file_name AS resume_file_name,
                   r.parsed_data AS resume_parsed_data
            FROM applicants a
            LEFT JOIN candidates c ON c.id = a.candidate_id
            LEFT JOIN resumes r ON r.id = a.resume_id
            WHERE a.job_id = $1
            ORDER BY a.id
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, description,
                   COALESCE(requirements, '{}') AS requirements,
                   COALESCE(skills, '{}') AS skills,
                   ranking_status, ranking_task_id, ranking_error,
                   ranking_started_at, ranking_completed_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_job_ranking_started(
        &self,
        job_id: &str,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET ranking_status = $2, ranking_started_at = $3,
                ranking_task_id = $4, ranking_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(job_ranking::IN_PROGRESS)
        .bind(at)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_ranking_completed(&self, job_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET ranking_status = $2, ranking_completed_at = $3, last_ranked_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(job_ranking::COMPLETED)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_ranking_failed(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET ranking_status = $2, ranking_error = $3 WHERE id = $1")
            .bind(job_id)
            .bind(job_ranking::FAILED)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
