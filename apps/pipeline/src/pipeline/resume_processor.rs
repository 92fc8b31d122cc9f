//! Resume Processor - runs one resume through fetch, parse and ranking ingestion.
//!
//! Progress checkpoints written to the status cache (and the `resume-status`
//! queue): queued 0, fetching 10, fetched 20, parsing 30, ingesting 60,
//! persisting 80, done 100. A parse failure degrades the result but does not
//! stop the run; a failed fetch or an exhausted ingestion retry does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::ai_client::{AiError, ResumeServices};
use crate::broker::{publish_json, Publisher, RESUME_STATUS_QUEUE};
use crate::config::PipelineConfig;
use crate::models::messages::{ResumeProcessingMessage, ResumeStatusMessage};
use crate::models::records::ResumeOutcome;
use crate::models::status::{ProcessingStatus, ResumeStage};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::pipeline::accumulator::BatchSink;
use crate::pipeline::now_ms;
use crate::status_cache::StatusCache;
use crate::store::RecruitingStore;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Resume not found: {0}")]
    ResumeNotFound(String),

    #[error("Resume {0} has no stored file")]
    MissingFile(String),

    #[error("Failed to fetch resume file: {0}")]
    Fetch(#[from] ObjectStoreError),

    #[error("Ranking ingestion failed after {attempts} attempts: {last}")]
    Ingestion { attempts: u32, last: AiError },

    #[error("Document store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The resume was already completed; nothing external was called.
    AlreadyProcessed,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestRetry {
    pub max_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n × backoff` before retrying.
    pub backoff: Duration,
}

impl From<&PipelineConfig> for IngestRetry {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.ingest_max_attempts.max(1),
            backoff: config.ingest_backoff,
        }
    }
}

/// What a run has gathered so far; kept even when the run fails.
#[derive(Debug, Default)]
struct RunProgress {
    errors: Vec<String>,
    parsed_data: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct ResumeProcessor {
    store: Arc<dyn RecruitingStore>,
    objects: Arc<dyn ObjectStore>,
    services: Arc<dyn ResumeServices>,
    cache: StatusCache,
    publisher: Arc<dyn Publisher>,
    retry: IngestRetry,
}

impl ResumeProcessor {
    pub fn new(
        store: Arc<dyn RecruitingStore>,
        objects: Arc<dyn ObjectStore>,
        services: Arc<dyn ResumeServices>,
        cache: StatusCache,
        publisher: Arc<dyn Publisher>,
        retry: IngestRetry,
    ) -> Self {
        Self {
            store,
            objects,
            services,
            cache,
            publisher,
            retry,
        }
    }

    /// Processes one resume. On failure the resume is persisted as `error`
    /// with every error collected along the way, and the error is returned.
    pub async fn process(
        &self,
        message: &ResumeProcessingMessage,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let mut progress = RunProgress::default();
        match self.run(message, &mut progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Processing resume {} failed: {e}", message.resume_id);
                progress.errors.push(e.to_string());
                let joined = progress.errors.join("; ");

                let outcome = ResumeOutcome {
                    status: ResumeStage::Error.as_str(),
                    parsed_data: progress.parsed_data,
                    processing_error: Some(joined.clone()),
                };
                if !matches!(e, ProcessingError::ResumeNotFound(_)) {
                    if let Err(store_err) =
                        self.store.save_resume_outcome(&message.resume_id, &outcome).await
                    {
                        error!(
                            "Failed to record error state for resume {}: {store_err}",
                            message.resume_id
                        );
                    }
                }
                self.report(message, ResumeStage::Error, 0, Some(joined)).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        message: &ResumeProcessingMessage,
        progress: &mut RunProgress,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let resume = self
            .store
            .find_resume(&message.resume_id)
            .await?
            .ok_or_else(|| ProcessingError::ResumeNotFound(message.resume_id.clone()))?;

        if resume.is_completed() {
            info!("Resume {} already processed, skipping", resume.id);
            if !message.is_direct_upload() {
                self.store
                    .mark_applicant_resume_processed(&message.applicant_id, Utc::now())
                    .await?;
            }
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        self.store.mark_resume_queued(&resume.id).await?;
        self.report(message, ResumeStage::Queued, 0, None).await;

        // Fetch
        self.report(message, ResumeStage::Processing, 10, None).await;
        let object_key = resume
            .file_path
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProcessingError::MissingFile(resume.id.clone()))?;
        let content = self.objects.get(object_key).await?;
        self.report(message, ResumeStage::Processing, 20, None).await;

        // Parse
        self.report(message, ResumeStage::Processing, 30, None).await;
        match self.services.parse_resume(object_key, &resume.file_name).await {
            Ok(parsed) => progress.parsed_data = Some(parsed),
            Err(e) => {
                warn!(
                    "Parsing resume {} failed, continuing without parsed content: {e}",
                    resume.id
                );
                progress.errors.push(format!("Parse error: {e}"));
            }
        }

        // Ingest
        self.report(message, ResumeStage::Processing, 60, None).await;
        self.ingest_with_retry(&resume.id, &resume.file_name, content).await?;

        // Persist
        self.report(message, ResumeStage::Processing, 80, None).await;
        let outcome = ResumeOutcome {
            status: ResumeStage::Completed.as_str(),
            parsed_data: progress.parsed_data.take(),
            processing_error: (!progress.errors.is_empty()).then(|| progress.errors.join("; ")),
        };
        self.store.save_resume_outcome(&resume.id, &outcome).await?;

        if !message.is_direct_upload() {
            self.store
                .mark_applicant_resume_processed(&message.applicant_id, Utc::now())
                .await?;
        }

        self.report(message, ResumeStage::Completed, 100, None).await;
        info!("Resume {} processed", resume.id);
        Ok(ProcessOutcome::Completed)
    }

    async fn ingest_with_retry(
        &self,
        resume_id: &str,
        file_name: &str,
        content: bytes::Bytes,
    ) -> Result<(), ProcessingError> {
        let max_attempts = self.retry.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.services.ingest_resume(file_name, content.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_attempts => {
                    return Err(ProcessingError::Ingestion {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Ranking ingestion attempt {attempt}/{max_attempts} for resume {resume_id} failed: {e}"
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
            }
        }
    }

    /// Writes the status to the cache and the status queue. Failures are logged only.
    async fn report(
        &self,
        message: &ResumeProcessingMessage,
        stage: ResumeStage,
        progress: u8,
        error: Option<String>,
    ) {
        let status = ProcessingStatus {
            task_id: message.task_id.clone(),
            status: stage,
            progress,
            error,
            timestamp: now_ms(),
        };

        if let Err(e) = self.cache.set_resume_status(&message.resume_id, &status).await {
            warn!("Failed to cache status for resume {}: {e}", message.resume_id);
        }

        let update = ResumeStatusMessage {
            resume_id: message.resume_id.clone(),
            status,
        };
        if let Err(e) = publish_json(self.publisher.as_ref(), RESUME_STATUS_QUEUE, &update, 0).await
        {
            warn!("Failed to publish status for resume {}: {e}", message.resume_id);
        }
    }

    /// Processes every resume concurrently; one failure never affects the others.
    pub async fn run_batch(&self, batch: Vec<ResumeProcessingMessage>) -> BatchStats {
        let size = batch.len();
        info!("Processing batch of {size} resumes");

        let mut tasks = JoinSet::new();
        for message in batch {
            let processor = self.clone();
            tasks.spawn(async move { processor.process(&message).await });
        }

        let mut stats = BatchStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => stats.succeeded += 1,
                Ok(Err(_)) => stats.failed += 1,
                Err(e) => {
                    error!("Resume task panicked: {e}");
                    stats.failed += 1;
                }
            }
        }

        info!(
            "Batch processing completed: {} succeeded, {} failed",
            stats.succeeded, stats.failed
        );
        stats
    }
}

#[async_trait]
impl BatchSink<ResumeProcessingMessage> for ResumeProcessor {
    async fn process_batch(&self, batch: Vec<ResumeProcessingMessage>) {
        self.run_batch(batch).await;
    }
}
