//! AI service client - the single point of entry for the external resume
//! parsing, ranking-ingestion and batch-ranking HTTP services.
//!
//! No other module may call those services directly. Calls here are single
//! attempt; retry policy lives with the caller that owns the pipeline stage.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, PipelineConfig};
use crate::models::ranking::{BatchRankingRequest, BatchRankingResponse, CandidateScore};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response structure: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParseRequest<'a> {
    object_key: &'a str,
    file_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(alias = "detail", alias = "error")]
    message: Value,
}

/// The operations the pipeline needs from the external AI services.
#[async_trait]
pub trait ResumeServices: Send + Sync {
    /// Parses an uploaded resume into structured JSON.
    async fn parse_resume(&self, object_key: &str, file_name: &str) -> Result<Value, AiError>;

    /// Hands the raw resume file to the ranking service's ingestion endpoint.
    async fn ingest_resume(&self, file_name: &str, content: Bytes) -> Result<(), AiError>;

    /// Scores one page of resumes against a job description.
    async fn rank_batch(&self, request: &BatchRankingRequest) -> Result<Vec<CandidateScore>, AiError>;
}

#[derive(Clone)]
pub struct AiClient {
    client: Client,
    parser_url: String,
    rank_ingest_url: String,
    batch_rank_url: String,
    pipeline: PipelineConfig,
}

impl AiClient {
    pub fn new(config: &Config) -> Result<Self, AiError> {
        Ok(Self {
            client: Client::builder().build()?,
            parser_url: config.parser_url.clone(),
            rank_ingest_url: config.rank_ingest_url.clone(),
            batch_rank_url: config.batch_rank_url.clone(),
            pipeline: config.pipeline.clone(),
        })
    }

    async fn error_from(response: reqwest::Response) -> AiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        AiError::Api {
            status,
            message: extract_error_message(&body),
        }
    }
}

#[async_trait]
impl ResumeServices for AiClient {
    async fn parse_resume(&self, object_key: &str, file_name: &str) -> Result<Value, AiError> {
        let response = self
            .client
            .post(&self.parser_url)
            .timeout(self.pipeline.parse_timeout)
            .json(&ParseRequest {
                object_key,
                file_name,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::error_from(response).await;
            warn!("Parsing service rejected {object_key}: {err}");
            return Err(err);
        }

        let parsed: Value = response.json().await?;
        debug!("Parsed {object_key}");
        Ok(parsed)
    }

    async fn ingest_resume(&self, file_name: &str, content: Bytes) -> Result<(), AiError> {
        let part = multipart::Part::bytes(content.to_vec()).file_name(file_name.to_string());
        let form = multipart::Form::new().part("files", part);

        let response = self
            .client
            .post(&self.rank_ingest_url)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        debug!("Ranking service ingested {file_name}");
        Ok(())
    }

    async fn rank_batch(&self, request: &BatchRankingRequest) -> Result<Vec<CandidateScore>, AiError> {
        let timeout = self.pipeline.rank_timeout_for(request.resumes.len());
        debug!(
            "Ranking {} resumes (timeout {}ms)",
            request.resumes.len(),
            timeout.as_millis()
        );

        let response = self
            .client
            .post(&self.batch_rank_url)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body = response.text().await?;
        let parsed: BatchRankingResponse = serde_json::from_str(&body)
            .map_err(|e| AiError::InvalidResponse(format!("batch ranking: {e}")))?;
        Ok(parsed.results)
    }
}

/// Pulls a human-readable message out of an error body, falling back to the raw text.
fn extract_error_message(body: &str) -> String {
    match serde_json::from_str::<ServiceError>(body) {
        Ok(ServiceError {
            message: Value::String(message),
        }) => message,
        Ok(ServiceError { message }) => message.to_string(),
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.to_string(),
    }
}
