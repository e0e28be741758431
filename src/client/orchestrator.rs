use crate::bucket::protocol::{ENDPOINT_BLOB, ENDPOINT_UPLOAD, UploadRequest, UploadResponse};
use crate::digest::{ContentDigest, digest_bytes};
use crate::directory::error::DirectoryError;
use crate::directory::protocol::{
    AllocateRequest, AllocateResponse, ENDPOINT_ALLOCATE, ENDPOINT_FINALIZE, ENDPOINT_LOCATE,
    ENDPOINT_USER, FinalizeRequest, FinalizeResponse, LocateResponse, UserResponse,
};
use crate::directory::types::{BucketId, UserId};

use anyhow::Result;
use std::time::Duration;
use thiserror::Error;

const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);
const BUCKET_TIMEOUT: Duration = Duration::from_secs(30);
const ATTEMPTS: usize = 3;

/// What a caller gets back from the orchestrator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The directory refused the operation; the variant says why.
    #[error("directory rejected the request: {0}")]
    Rejected(DirectoryError),

    /// The bucket's digest check failed. The lease has been rolled back;
    /// retrying the whole store sequence gets a fresh allocation.
    #[error("uploaded bytes failed the bucket's digest verification")]
    CorruptedUpload,

    #[error("object not found")]
    NotFound,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Outcome of a successful store.
#[derive(Debug, Clone)]
pub struct StoreReceipt {
    pub digest: ContentDigest,
    pub bucket_id: BucketId,
    pub size: u64,
    /// True when the content was already in the cluster and no upload ran.
    pub deduplicated: bool,
}

/// Drives the end-to-end flow against the index and bucket nodes:
/// digest -> allocate -> upload -> finalize, plus locate -> read.
pub struct StorageClient {
    index_url: String,
    http_client: reqwest::Client,
}

impl StorageClient {
    /// `index_url` is the index node's base URL, e.g. "http://127.0.0.1:7000".
    pub fn new(index_url: impl Into<String>) -> Self {
        Self {
            index_url: index_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Stores `bytes` under their content digest.
    pub async fn store(&self, user_id: &UserId, bytes: &[u8]) -> Result<StoreReceipt, ClientError> {
        let digest = digest_bytes(bytes);
        let size = bytes.len() as u64;

        let response = self
            .post_with_retry(
                format!("{}{}", self.index_url, ENDPOINT_ALLOCATE),
                &AllocateRequest {
                    user_id: user_id.clone(),
                    digest,
                    size,
                },
                DIRECTORY_TIMEOUT,
                ATTEMPTS,
            )
            .await?;
        let allocate: AllocateResponse =
            response.json().await.map_err(|e| anyhow::anyhow!(e))?;

        if let Some(error) = allocate.error {
            return Err(ClientError::Rejected(error));
        }
        let Some(assignment) = allocate.assignment else {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "allocate returned neither assignment nor error"
            )));
        };

        if assignment.already_stored {
            tracing::debug!(
                "Digest {} already stored on bucket {:?}, skipping upload",
                digest,
                assignment.bucket_id
            );
            return Ok(StoreReceipt {
                digest,
                bucket_id: assignment.bucket_id,
                size: assignment.size,
                deduplicated: true,
            });
        }

        let lease_token = assignment.lease_token.clone().ok_or_else(|| {
            ClientError::Transport(anyhow::anyhow!("pending assignment is missing a lease token"))
        })?;

        let response = self
            .post_with_retry(
                format!("http://{}{}", assignment.bucket_addr, ENDPOINT_UPLOAD),
                &UploadRequest {
                    lease_token: lease_token.clone(),
                    digest,
                    bytes: bytes.to_vec(),
                },
                BUCKET_TIMEOUT,
                ATTEMPTS,
            )
            .await?;
        let upload: UploadResponse = response.json().await.map_err(|e| anyhow::anyhow!(e))?;

        // The verdict is forwarded either way: a false verdict is what makes
        // the directory roll the reservation back.
        let response = self
            .post_with_retry(
                format!("{}{}", self.index_url, ENDPOINT_FINALIZE),
                &FinalizeRequest {
                    lease_token,
                    digest,
                    size,
                    verified: upload.verified,
                },
                DIRECTORY_TIMEOUT,
                ATTEMPTS,
            )
            .await?;
        let finalize: FinalizeResponse = response.json().await.map_err(|e| anyhow::anyhow!(e))?;

        if !upload.verified {
            return Err(ClientError::CorruptedUpload);
        }
        if let Some(error) = finalize.error {
            return Err(ClientError::Rejected(error));
        }

        tracing::info!("Stored {} bytes as {} on bucket {:?}", size, digest, assignment.bucket_id);
        Ok(StoreReceipt {
            digest,
            bucket_id: assignment.bucket_id,
            size,
            deduplicated: false,
        })
    }

    /// Reads an object back: resolves its bucket via the directory, then
    /// fetches the raw bytes.
    pub async fn fetch(&self, digest: &ContentDigest) -> Result<Vec<u8>, ClientError> {
        let response = self
            .get_with_retry(
                format!("{}{}/{}", self.index_url, ENDPOINT_LOCATE, digest),
                DIRECTORY_TIMEOUT,
                ATTEMPTS,
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "locate failed: {}",
                response.status()
            )));
        }
        let located: Option<LocateResponse> =
            response.json().await.map_err(|e| anyhow::anyhow!(e))?;
        let Some(located) = located else {
            return Err(ClientError::NotFound);
        };

        let response = self
            .get_with_retry(
                format!("http://{}{}/{}", located.bucket_addr, ENDPOINT_BLOB, digest),
                BUCKET_TIMEOUT,
                ATTEMPTS,
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "blob read failed: {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await.map_err(|e| anyhow::anyhow!(e))?;
        Ok(bytes.to_vec())
    }

    /// Read-only account snapshot.
    pub async fn get_user(&self, user_id: &UserId) -> Result<UserResponse, ClientError> {
        let response = self
            .get_with_retry(
                format!("{}{}/{}", self.index_url, ENDPOINT_USER, user_id.0),
                DIRECTORY_TIMEOUT,
                ATTEMPTS,
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::Rejected(DirectoryError::UserNotFound));
        }

        let user: Option<UserResponse> = response.json().await.map_err(|e| anyhow::anyhow!(e))?;
        user.ok_or(ClientError::Rejected(DirectoryError::UserNotFound))
    }

    // --- HTTP Helpers with Backoff ---

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    async fn get_with_retry(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}
