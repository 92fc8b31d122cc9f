use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("S3 error: {0}")]
    Backend(String),
}

/// Read access to resume files and their parsed markdown. Uploads are
/// written by the upload service under `resumes/<userId>/<resumeId>/<fileName>`
/// and the key is stored on the resume record.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
}

/// `parsed/<fileName without extension>.md`
pub fn parsed_markdown_key(file_name: &str) -> String {
    let base = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };
    format!("parsed/{base}.md")
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    ObjectStoreError::NotFound(key.to_string())
                } else {
                    ObjectStoreError::Backend(format!("get {key}: {service_error}"))
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("read {key}: {e}")))?
            .into_bytes();

        debug!("Fetched s3://{}/{} ({} bytes)", self.bucket, key, body.len());
        Ok(body)
    }
}
