//! Status Cache - TTL'd key/value store for progress tracking and result caching.
//!
//! The cache is an advisory, non-atomic lock: it tells late duplicate requests
//! that work is in progress, but two processes can still race past it.
//! Callers must tolerate idempotent re-entry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::models::messages::StatusUpdateMessage;
use crate::models::ranking::RankingResultsEntry;
use crate::models::status::ProcessingStatus;
use crate::redis_conn::RedisHandle;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cached value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raw string key/value store with optional expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<u64, CacheError>;
}

pub struct RedisKeyValueStore {
    redis: RedisHandle,
}

impl RedisKeyValueStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, CacheError> {
        let mut conn = self.redis.connection().await?;
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.redis.report_error(&e).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await.map_err(|e| {
            error!("Error getting key {key} from Redis: {e}");
            e
        })
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        self.run::<()>(cmd).await.map_err(|e| {
            error!("Error setting key {key} in Redis: {e}");
            e
        })
    }

    async fn del(&self, key: &str) -> Result<u64, CacheError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(cmd).await.map_err(|e| {
            error!("Error deleting key {key} from Redis: {e}");
            e
        })
    }
}

pub fn resume_status_key(resume_id: &str) -> String {
    format!("resume:processing:{resume_id}")
}

pub fn ranking_status_key(job_id: &str) -> String {
    format!("ranking:job:{job_id}:status")
}

pub fn ranking_results_key(job_id: &str) -> String {
    format!("ranking:job:{job_id}:results")
}

/// Typed view over the key/value store for the three pipeline key families.
#[derive(Clone)]
pub struct StatusCache {
    store: Arc<dyn KeyValueStore>,
    ttl_secs: u64,
}

impl StatusCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub async fn resume_status(&self, resume_id: &str) -> Result<Option<ProcessingStatus>, CacheError> {
        self.get_json(&resume_status_key(resume_id)).await
    }

    pub async fn set_resume_status(
        &self,
        resume_id: &str,
        status: &ProcessingStatus,
    ) -> Result<(), CacheError> {
        self.set_json(&resume_status_key(resume_id), status).await
    }

    pub async fn ranking_status(&self, job_id: &str) -> Result<Option<StatusUpdateMessage>, CacheError> {
        self.get_json(&ranking_status_key(job_id)).await
    }

    pub async fn set_ranking_status(&self, status: &StatusUpdateMessage) -> Result<(), CacheError> {
        self.set_json(&ranking_status_key(&status.job_id), status).await
    }

    pub async fn ranking_results(&self, job_id: &str) -> Result<Option<RankingResultsEntry>, CacheError> {
        self.get_json(&ranking_results_key(job_id)).await
    }

    pub async fn set_ranking_results(
        &self,
        job_id: &str,
        entry: &RankingResultsEntry,
    ) -> Result<(), CacheError> {
        self.set_json(&ranking_results_key(job_id), entry).await
    }

    pub async fn has_ranking_results(&self, job_id: &str) -> Result<bool, CacheError> {
        Ok(self.store.get(&ranking_results_key(job_id)).await?.is_some())
    }

    pub async fn evict_ranking_results(&self, job_id: &str) -> Result<(), CacheError> {
        let removed = self.store.del(&ranking_results_key(job_id)).await?;
        debug!("Evicted {removed} stale ranking result entries for job {job_id}");
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, &raw, Some(self.ttl_secs)).await
    }
}
