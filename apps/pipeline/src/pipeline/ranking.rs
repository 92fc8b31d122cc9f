//! Ranking Orchestrator - ranks a job's whole applicant pool page by page.
//!
//! Pages are independent: a page whose ranking call fails is logged and
//! skipped, and the run still completes with the pages that succeeded. Only
//! failures outside a page (job lookup, status bookkeeping, the results
//! cache) fail the run, and that is terminal for the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ai_client::{AiError, ResumeServices};
use crate::broker::{publish_json, Publisher, RANKING_STATUS_QUEUE};
use crate::config::PipelineConfig;
use crate::models::messages::{RankingJobMessage, StatusUpdateMessage};
use crate::models::ranking::{
    sort_by_score_desc, ApplicantScoreUpdate, BatchRankingRequest, CandidateScore,
    RankingResult, RankingResultsEntry, ResumeForRanking, ResumeMetadata,
};
use crate::models::records::{parsed_data_text, ApplicantForRanking, JobRecord};
use crate::models::status::RankingState;
use crate::object_store::{parsed_markdown_key, ObjectStore};
use crate::pipeline::now_ms;
use crate::status_cache::{CacheError, StatusCache};
use crate::store::RecruitingStore;

#[derive(Debug, Error)]
pub enum RankingError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Document store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("Status cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingSummary {
    pub total: u64,
    pub processed: u64,
    pub ranked: usize,
    pub failed_pages: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PagingSettings {
    pub page_size: u64,
    /// Pause after a successfully ranked page when more pages follow.
    pub page_pause: Duration,
}

impl From<&PipelineConfig> for PagingSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            page_size: u64::from(config.ranking_page_size.max(1)),
            page_pause: config.ranking_page_pause,
        }
    }
}

pub struct RankingOrchestrator {
    store: Arc<dyn RecruitingStore>,
    objects: Arc<dyn ObjectStore>,
    services: Arc<dyn ResumeServices>,
    cache: StatusCache,
    publisher: Arc<dyn Publisher>,
    paging: PagingSettings,
}

impl RankingOrchestrator {
    pub fn new(
        store: Arc<dyn RecruitingStore>,
        objects: Arc<dyn ObjectStore>,
        services: Arc<dyn ResumeServices>,
        cache: StatusCache,
        publisher: Arc<dyn Publisher>,
        paging: PagingSettings,
    ) -> Self {
        Self {
            store,
            objects,
            services,
            cache,
            publisher,
            paging,
        }
    }

    /// Runs one ranking task to a terminal state. On failure the job is
    /// marked failed, a `failed` status is pushed and the error is returned.
    pub async fn run(&self, message: &RankingJobMessage) -> Result<RankingSummary, RankingError> {
        info!(
            "Starting ranking task {} for job {} ({} applicants)",
            message.task_id, message.job_id, message.total_applicants
        );

        match self.rank(message).await {
            Ok(summary) => {
                info!(
                    "Ranking task {} completed: {}/{} applicants ranked, {} page(s) failed",
                    message.task_id, summary.processed, summary.total, summary.failed_pages
                );
                Ok(summary)
            }
            Err(e) => {
                error!(
                    "Ranking task {} for job {} failed: {e}",
                    message.task_id, message.job_id
                );
                let reason = e.to_string();
                if let Err(store_err) = self.store.mark_job_ranking_failed(&message.job_id, &reason).await {
                    error!("Failed to mark job {} as failed: {store_err}", message.job_id);
                }

                let mut update = StatusUpdateMessage::progress_of(
                    &message.task_id,
                    &message.job_id,
                    RankingState::Failed,
                    0,
                    message.total_applicants,
                    now_ms(),
                );
                update.error = Some(reason);
                self.report(&update).await;
                Err(e)
            }
        }
    }

    async fn rank(&self, message: &RankingJobMessage) -> Result<RankingSummary, RankingError> {
        let job = self
            .store
            .find_job(&message.job_id)
            .await?
            .ok_or_else(|| RankingError::JobNotFound(message.job_id.clone()))?;
        let total = message.total_applicants;

        self.store
            .mark_job_ranking_started(&job.id, &message.task_id, Utc::now())
            .await?;
        self.report(&self.progress(message, RankingState::Processing, 0))
            .await;

        let mut results: Vec<RankingResult> = Vec::new();
        let mut processed = 0u64;
        let mut failed_pages = 0usize;
        let mut skip = 0u64;
        let mut page_number = 0u64;

        while skip < total {
            page_number += 1;
            let limit = self.paging.page_size.min(total - skip);
            let page = self.store.applicants_page(&job.id, skip, limit).await?;
            skip += limit;

            if page.is_empty() {
                warn!(
                    "Job {} ran out of applicants at page {page_number}; expected {total}",
                    job.id
                );
                break;
            }

            match self.rank_page(&job, &page).await {
                Ok(scores) => {
                    self.persist_scores(&page, &scores).await;
                    results.extend(scores.iter().map(RankingResult::from));
                    processed += page.len() as u64;
                    debug!(
                        "Ranked page {page_number} of job {} ({} results)",
                        job.id,
                        scores.len()
                    );

                    self.report(&self.progress(message, RankingState::Processing, processed))
                        .await;

                    if skip < total && !self.paging.page_pause.is_zero() {
                        tokio::time::sleep(self.paging.page_pause).await;
                    }
                }
                Err(e) => {
                    failed_pages += 1;
                    error!(
                        "Ranking page {page_number} of job {} failed, skipping: {e}",
                        job.id
                    );
                }
            }
        }

        sort_by_score_desc(&mut results);
        let processed = processed.min(total);
        let entry = RankingResultsEntry {
            timestamp: now_ms(),
            total,
            processed,
            results,
        };
        self.cache.set_ranking_results(&job.id, &entry).await?;

        self.store
            .mark_job_ranking_completed(&job.id, Utc::now())
            .await?;
        self.report(&self.progress(message, RankingState::Completed, processed))
            .await;

        Ok(RankingSummary {
            total,
            processed,
            ranked: entry.results.len(),
            failed_pages,
        })
    }

    async fn rank_page(
        &self,
        job: &JobRecord,
        page: &[ApplicantForRanking],
    ) -> Result<Vec<CandidateScore>, AiError> {
        let mut resumes = Vec::with_capacity(page.len());
        for applicant in page {
            resumes.push(ResumeForRanking {
                candidate_id: applicant.candidate_id.clone(),
                name: applicant.candidate_name.clone().unwrap_or_default(),
                content: self.resume_content(applicant).await,
                metadata: ResumeMetadata {
                    skills: applicant.candidate_skills.clone(),
                    experience: applicant.candidate_experience.clone().unwrap_or_default(),
                    applicant_id: applicant.applicant_id.clone(),
                },
            });
        }

        let request = BatchRankingRequest {
            job_description: job.description.clone(),
            requirements: job.requirements.clone(),
            skills: job.skills.clone(),
            resumes,
        };
        self.services.rank_batch(&request).await
    }

    /// Parsed markdown from the object store, else the parsed data stored on the resume.
    async fn resume_content(&self, applicant: &ApplicantForRanking) -> String {
        if let Some(file_name) = applicant.resume_file_name.as_deref() {
            let key = parsed_markdown_key(file_name);
            match self.objects.get(&key).await {
                Ok(body) if !body.is_empty() => return String::from_utf8_lossy(&body).into_owned(),
                Ok(_) => debug!("Parsed markdown {key} is empty, using stored parsed data"),
                Err(e) => debug!("No parsed markdown for applicant {}: {e}", applicant.applicant_id),
            }
        }
        parsed_data_text(applicant.resume_parsed_data.as_ref())
    }

    async fn persist_scores(&self, page: &[ApplicantForRanking], scores: &[CandidateScore]) {
        let applicants: HashMap<&str, &str> = page
            .iter()
            .map(|a| (a.candidate_id.as_str(), a.applicant_id.as_str()))
            .collect();

        for score in scores {
            let Some(applicant_id) = applicants.get(score.candidate_id.as_str()) else {
                warn!(
                    "Ranking result for unknown candidate {} ignored",
                    score.candidate_id
                );
                continue;
            };
            let update = ApplicantScoreUpdate::from(score);
            if let Err(e) = self.store.update_applicant_scores(applicant_id, &update).await {
                error!("Failed to store scores for applicant {applicant_id}: {e}");
            }
        }
    }

    fn progress(
        &self,
        message: &RankingJobMessage,
        state: RankingState,
        processed: u64,
    ) -> StatusUpdateMessage {
        StatusUpdateMessage::progress_of(
            &message.task_id,
            &message.job_id,
            state,
            processed,
            message.total_applicants,
            now_ms(),
        )
    }

    /// Writes the status to the cache and the `ranking-status` queue. Failures are logged only.
    async fn report(&self, update: &StatusUpdateMessage) {
        if let Err(e) = self.cache.set_ranking_status(update).await {
            warn!("Failed to cache ranking status for job {}: {e}", update.job_id);
        }
        if let Err(e) = publish_json(self.publisher.as_ref(), RANKING_STATUS_QUEUE, update, 0).await {
            warn!("Failed to publish ranking status for job {}: {e}", update.job_id);
        }
    }
}
