//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ai_client::{AiError, ResumeServices};
use crate::broker::{
    delivery_score, BrokerError, Envelope, Publisher, QueueSpec, QueueStore, RawDelivery, Settlement,
};
use crate::models::messages::{RankingJobMessage, ResumeProcessingMessage};
use crate::models::ranking::{ApplicantScoreUpdate, BatchRankingRequest, CandidateScore};
use crate::models::records::{ApplicantForRanking, JobRecord, ResumeOutcome, ResumeRecord};
use crate::models::status::job_ranking;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::pipeline::ranking::{PagingSettings, RankingOrchestrator};
use crate::pipeline::resume_processor::{IngestRetry, ResumeProcessor};
use crate::status_cache::{CacheError, KeyValueStore, StatusCache};

// ────────────────────────────────────────────────────────────────────────────
// Wiring
// ────────────────────────────────────────────────────────────────────────────

/// One set of fakes, wired into pipeline components the way `main` does it.
pub struct Fakes {
    pub store: Arc<MemoryStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub services: Arc<FakeServices>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub cache: StatusCache,
    pub publisher: Arc<RecordingPublisher>,
}

impl Default for Fakes {
    fn default() -> Self {
        let kv = Arc::new(MemoryKeyValueStore::default());
        Self {
            store: Arc::default(),
            objects: Arc::default(),
            services: Arc::default(),
            cache: StatusCache::new(kv.clone(), 86_400),
            kv,
            publisher: Arc::default(),
        }
    }
}

impl Fakes {
    pub fn processor(&self, max_attempts: u32, backoff: Duration) -> ResumeProcessor {
        ResumeProcessor::new(
            self.store.clone(),
            self.objects.clone(),
            self.services.clone(),
            self.cache.clone(),
            self.publisher.clone(),
            IngestRetry {
                max_attempts,
                backoff,
            },
        )
    }

    pub fn orchestrator(&self, page_pause: Duration) -> RankingOrchestrator {
        RankingOrchestrator::new(
            self.store.clone(),
            self.objects.clone(),
            self.services.clone(),
            self.cache.clone(),
            self.publisher.clone(),
            PagingSettings {
                page_size: 10,
                page_pause,
            },
        )
    }

    /// Stores a pending resume with its file and returns the message that queues it.
    pub fn seed_resume(&self, resume_id: &str, applicant_id: &str) -> ResumeProcessingMessage {
        let resume = resume_record(resume_id, None);
        if let Some(key) = resume.file_path.as_deref() {
            self.objects.insert(key, "%PDF-1.7 Jane Doe");
        }
        self.store.insert_resume(resume);
        resume_message(resume_id, applicant_id)
    }
}

pub fn resume_message(resume_id: &str, applicant_id: &str) -> ResumeProcessingMessage {
    ResumeProcessingMessage {
        task_id: format!("task-{resume_id}"),
        resume_id: resume_id.to_string(),
        file_name: "jane.pdf".to_string(),
        job_id: "job-1".to_string(),
        applicant_id: applicant_id.to_string(),
        candidate_id: "cand-1".to_string(),
        priority: 5,
        timestamp: 0,
    }
}

pub fn ranking_message(job_id: &str, total: u64) -> RankingJobMessage {
    RankingJobMessage {
        task_id: format!("task-{job_id}"),
        job_id: job_id.to_string(),
        recruiter_id: "rec-1".to_string(),
        total_applicants: total,
        force_refresh: false,
        timestamp: 0,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Key/value store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, (String, Option<u64>)>>,
    history: Mutex<Vec<(String, String)>>,
}

impl MemoryKeyValueStore {
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
    }

    pub fn ttl_of(&self, key: &str) -> Option<Option<u64>> {
        self.entries.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
    }

    /// Every value ever written to `key`, oldest first.
    pub fn writes_to(&self, key: &str) -> Vec<String> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl_secs));
        self.history
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.entries.lock().unwrap().remove(key).map_or(0, |_| 1))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Document store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ApplicantState {
    pub job_id: String,
    pub resume_processed: bool,
    pub resume_processed_at: Option<DateTime<Utc>>,
    pub score: Option<ApplicantScoreUpdate>,
}

#[derive(Default)]
pub struct MemoryStore {
    pub resumes: Mutex<HashMap<String, ResumeRecord>>,
    pub resume_outcomes: Mutex<Vec<(String, ResumeOutcome)>>,
    pub applicants: Mutex<HashMap<String, ApplicantState>>,
    pub pool: Mutex<Vec<ApplicantForRanking>>,
    pub jobs: Mutex<HashMap<String, JobRecord>>,
    pub fail_job_lookup: Mutex<bool>,
}

impl MemoryStore {
    pub fn insert_resume(&self, resume: ResumeRecord) {
        self.resumes.lock().unwrap().insert(resume.id.clone(), resume);
    }

    pub fn insert_job(&self, job: JobRecord) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    /// Adds `count` applicants for `job_id`, candidate ids `c0..`, applicant ids `a0..`.
    pub fn seed_applicants(&self, job_id: &str, count: usize) {
        let mut pool = self.pool.lock().unwrap();
        let mut applicants = self.applicants.lock().unwrap();
        for i in 0..count {
            let applicant_id = format!("a{i}");
            pool.push(ApplicantForRanking {
                applicant_id: applicant_id.clone(),
                candidate_id: format!("c{i}"),
                candidate_name: Some(format!("Candidate {i}")),
                candidate_skills: vec!["rust".to_string()],
                candidate_experience: Some("5 years".to_string()),
                resume_id: Some(format!("r{i}")),
                resume_file_name: Some(format!("cv{i}.pdf")),
                resume_parsed_data: Some(Value::String(format!("stored resume {i}"))),
            });
            applicants.insert(
                applicant_id,
                ApplicantState {
                    job_id: job_id.to_string(),
                    ..Default::default()
                },
            );
        }
    }

    pub fn applicant(&self, applicant_id: &str) -> ApplicantState {
        self.applicants
            .lock()
            .unwrap()
            .get(applicant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn job(&self, job_id: &str) -> JobRecord {
        self.jobs.lock().unwrap().get(job_id).cloned().unwrap()
    }

    pub fn resume(&self, resume_id: &str) -> ResumeRecord {
        self.resumes.lock().unwrap().get(resume_id).cloned().unwrap()
    }
}

pub fn resume_record(id: &str, status: Option<&str>) -> ResumeRecord {
    ResumeRecord {
        id: id.to_string(),
        candidate_id: "cand-1".to_string(),
        file_name: "jane.pdf".to_string(),
        file_path: Some(format!("resumes/cand-1/{id}/jane.pdf")),
        processing_status: status.map(String::from),
        parsed_data: None,
        processing_error: None,
        last_modified: None,
    }
}

pub fn job_record(id: &str) -> JobRecord {
    JobRecord {
        id: id.to_string(),
        description: "Senior Rust engineer".to_string(),
        requirements: vec!["5+ years".to_string()],
        skills: vec!["rust".to_string(), "tokio".to_string()],
        ranking_status: None,
        ranking_task_id: None,
        ranking_error: None,
        ranking_started_at: None,
        ranking_completed_at: None,
    }
}

#[async_trait]
impl crate::store::RecruitingStore for MemoryStore {
    async fn find_resume(&self, resume_id: &str) -> Result<Option<ResumeRecord>> {
        Ok(self.resumes.lock().unwrap().get(resume_id).cloned())
    }

    async fn mark_resume_queued(&self, resume_id: &str) -> Result<()> {
        if let Some(resume) = self.resumes.lock().unwrap().get_mut(resume_id) {
            resume.processing_status = Some("queued".to_string());
        }
        Ok(())
    }

    async fn save_resume_outcome(&self, resume_id: &str, outcome: &ResumeOutcome) -> Result<()> {
        if let Some(resume) = self.resumes.lock().unwrap().get_mut(resume_id) {
            resume.processing_status = Some(outcome.status.to_string());
            if outcome.parsed_data.is_some() {
                resume.parsed_data = outcome.parsed_data.clone();
            }
            resume.processing_error = outcome.processing_error.clone();
        }
        self.resume_outcomes
            .lock()
            .unwrap()
            .push((resume_id.to_string(), outcome.clone()));
        Ok(())
    }

    async fn mark_applicant_resume_processed(
        &self,
        applicant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut applicants = self.applicants.lock().unwrap();
        let applicant = applicants.entry(applicant_id.to_string()).or_default();
        if applicant.resume_processed {
            return Ok(false);
        }
        applicant.resume_processed = true;
        applicant.resume_processed_at = Some(at);
        Ok(true)
    }

    async fn update_applicant_scores(
        &self,
        applicant_id: &str,
        update: &ApplicantScoreUpdate,
    ) -> Result<()> {
        self.applicants
            .lock()
            .unwrap()
            .entry(applicant_id.to_string())
            .or_default()
            .score = Some(update.clone());
        Ok(())
    }

    async fn count_applicants(&self, job_id: &str) -> Result<u64> {
        Ok(self
            .applicants
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.job_id == job_id)
            .count() as u64)
    }

    async fn count_ranked_applicants(&self, job_id: &str) -> Result<u64> {
        Ok(self
            .applicants
            .lock()
            .unwrap()
            .values()
            .filter(|a| {
                a.job_id == job_id && a.score.as_ref().is_some_and(|s| s.job_fit_score > 0.0)
            })
            .count() as u64)
    }

    async fn applicants_page(
        &self,
        _job_id: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<ApplicantForRanking>> {
        Ok(self
            .pool
            .lock()
            .unwrap()
            .iter()
            .skip(skip as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        if *self.fail_job_lookup.lock().unwrap() {
            anyhow::bail!("connection reset by peer");
        }
        Ok(self.jobs.lock().unwrap().get(job_id).cloned())
    }

    async fn mark_job_ranking_started(
        &self,
        job_id: &str,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
            job.ranking_status = Some(job_ranking::IN_PROGRESS.to_string());
            job.ranking_task_id = Some(task_id.to_string());
            job.ranking_started_at = Some(at);
            job.ranking_error = None;
        }
        Ok(())
    }

    async fn mark_job_ranking_completed(&self, job_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
            job.ranking_status = Some(job_ranking::COMPLETED.to_string());
            job.ranking_completed_at = Some(at);
        }
        Ok(())
    }

    async fn mark_job_ranking_failed(&self, job_id: &str, error: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
            job.ranking_status = Some(job_ranking::FAILED.to_string());
            job.ranking_error = Some(error.to_string());
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Object store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    pub gets: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn insert(&self, key: &str, body: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from(body.to_string()));
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// AI services
// ────────────────────────────────────────────────────────────────────────────

/// Scripted AI services. Ingestion outcomes are consumed in order; once the
/// script runs out every ingestion succeeds. Batch ranking scores each
/// resume from its content length unless the call index is listed in
/// `failing_rank_calls`.
#[derive(Default)]
pub struct FakeServices {
    pub parse_calls: AtomicUsize,
    pub ingest_calls: AtomicUsize,
    pub rank_calls: AtomicUsize,
    pub parse_error: Mutex<Option<String>>,
    pub ingest_script: Mutex<VecDeque<Result<(), String>>>,
    pub failing_rank_calls: Mutex<Vec<usize>>,
    pub rank_requests: Mutex<Vec<BatchRankingRequest>>,
}

impl FakeServices {
    pub fn total_calls(&self) -> usize {
        self.parse_calls.load(Ordering::SeqCst)
            + self.ingest_calls.load(Ordering::SeqCst)
            + self.rank_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResumeServices for FakeServices {
    async fn parse_resume(&self, object_key: &str, _file_name: &str) -> Result<Value, AiError> {
        self.parse_calls.fetch_add(1, Ordering::SeqCst);
        match self.parse_error.lock().unwrap().clone() {
            Some(message) => Err(AiError::Api {
                status: 422,
                message,
            }),
            None => Ok(serde_json::json!({ "source": object_key, "name": "Jane Doe" })),
        }
    }

    async fn ingest_resume(&self, _file_name: &str, _content: Bytes) -> Result<(), AiError> {
        self.ingest_calls.fetch_add(1, Ordering::SeqCst);
        match self.ingest_script.lock().unwrap().pop_front() {
            Some(Err(message)) => Err(AiError::Api {
                status: 503,
                message,
            }),
            _ => Ok(()),
        }
    }

    async fn rank_batch(&self, request: &BatchRankingRequest) -> Result<Vec<CandidateScore>, AiError> {
        let call = self.rank_calls.fetch_add(1, Ordering::SeqCst);
        self.rank_requests.lock().unwrap().push(request.clone());
        if self.failing_rank_calls.lock().unwrap().contains(&call) {
            return Err(AiError::Api {
                status: 500,
                message: format!("ranking call {call} failed"),
            });
        }
        Ok(request
            .resumes
            .iter()
            .enumerate()
            .map(|(i, resume)| {
                serde_json::from_value(serde_json::json!({
                    "candidateId": resume.candidate_id,
                    "name": resume.name,
                    "total_score": (call * 10 + i) as f64 + 0.5,
                    "technical_score": 70.0,
                    "technical_strengths": ["rust"],
                    "experience_gaps": ["kubernetes"]
                }))
                .unwrap()
            })
            .collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Publisher
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, Value, u8)>>,
}

impl RecordingPublisher {
    pub fn messages_on(&self, queue: &str) -> Vec<(Value, u8)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, body, priority)| (body.clone(), *priority))
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, queue: &str, body: Value, priority: u8) -> Result<(), BrokerError> {
        self.published
            .lock()
            .unwrap()
            .push((queue.to_string(), body, priority));
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Queue storage
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    seq: u64,
    /// Queue name → (score, member), kept sorted by score.
    queues: HashMap<&'static str, Vec<(f64, String)>>,
    /// (queue, member) → (score, last stamp).
    unacked: HashMap<(&'static str, String), (f64, i64)>,
}

impl QueueState {
    fn insert(&mut self, queue: &'static QueueSpec, member: String, score: f64) {
        let entries = self.queues.entry(queue.name).or_default();
        entries.push((score, member));
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        if let Some(max_length) = queue.max_length {
            let excess = entries.len().saturating_sub(max_length);
            entries.drain(..excess);
        }
    }
}

impl MemoryQueueStore {
    /// Decoded bodies waiting on `queue`, in delivery order.
    pub fn bodies(&self, queue: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(_, member)| serde_json::from_str::<Envelope>(member).unwrap().body)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unacked_len(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn push(&self, queue: &'static QueueSpec, member: &str, priority: u8) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let score = delivery_score(queue, priority, state.seq);
        state.insert(queue, member.to_string(), score);
        Ok(())
    }

    async fn pop(&self, queue: &'static QueueSpec, now_ms: i64) -> Result<Option<RawDelivery>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        let entries = state.queues.entry(queue.name).or_default();
        if entries.is_empty() {
            return Ok(None);
        }
        let (score, member) = entries.remove(0);
        state
            .unacked
            .insert((queue.name, member.clone()), (score, now_ms));
        Ok(Some(RawDelivery { member, score }))
    }

    async fn touch(&self, queue: &'static QueueSpec, member: &str, now_ms: i64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.unacked.get_mut(&(queue.name, member.to_string())) {
            entry.1 = now_ms;
        }
        Ok(())
    }

    async fn settle(
        &self,
        queue: &'static QueueSpec,
        delivery: &RawDelivery,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state
            .unacked
            .remove(&(queue.name, delivery.member.clone()));
        match settlement {
            Settlement::Remove => {}
            Settlement::Requeue => state.insert(queue, delivery.member.clone(), delivery.score),
            Settlement::DeadLetter(dlq) => {
                state.seq += 1;
                let score = delivery_score(dlq, 0, state.seq);
                state.insert(dlq, delivery.member.clone(), score);
            }
        }
        Ok(())
    }

    async fn reclaim(&self, queue: &'static QueueSpec, stale_before_ms: i64) -> Result<usize, BrokerError> {
        let mut state = self.state.lock().unwrap();
        let stale: Vec<_> = state
            .unacked
            .iter()
            .filter(|((name, _), (_, stamp))| *name == queue.name && *stamp <= stale_before_ms)
            .map(|((_, member), (score, _))| (member.clone(), *score))
            .collect();
        for (member, score) in &stale {
            state.unacked.remove(&(queue.name, member.clone()));
            state.insert(queue, member.clone(), *score);
        }
        Ok(stale.len())
    }

    async fn close(&self) {}
}
