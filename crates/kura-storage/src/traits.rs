//! Transport abstraction
//!
//! This module defines the Transport trait that the uploader drives, and the errors every
//! transport reports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kura_core::UploadError;
use thiserror::Error;

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transfer stalled: no progress for {0:?}")]
    Stalled(Duration),

    #[error("Part {part_number} acknowledged without an ETag")]
    EtagMissing { part_number: usize },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Failed to read upload source: {0}")]
    Source(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether the same request may succeed if issued again
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            TransportError::Timeout
            | TransportError::Connection(_)
            | TransportError::Stalled(_) => true,
            TransportError::EtagMissing { .. }
            | TransportError::Cancelled
            | TransportError::Source(_)
            | TransportError::InvalidRequest(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

impl From<TransportError> for UploadError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::EtagMissing { part_number } => UploadError::EtagMissing { part_number },
            TransportError::Status { status: 401, .. } => UploadError::SessionExpired,
            TransportError::Status {
                status: 402 | 426,
                body,
            } => UploadError::QuotaExceeded(body),
            TransportError::Cancelled => UploadError::Cancelled,
            e if e.is_retryable() => UploadError::Network(e.to_string()),
            e => UploadError::Storage(e.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Called with the number of bytes of the current request sent so far
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Transport abstraction trait
///
/// Every URL is pre-signed and used for exactly one object or part. Implementations must not
/// retry on their own; retrying is the caller's policy.
#[async_trait]
pub trait Transport: Send + Sync {
    /// PUT a whole object
    async fn put_object(
        &self,
        url: &str,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<()>;

    /// PUT one multipart part and return its ETag
    async fn put_part(
        &self,
        url: &str,
        part_number: usize,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<String>;

    /// POST the completion manifest
    async fn complete_multipart(&self, url: &str, manifest_xml: String) -> TransportResult<()>;
}

/// Ordered source of already-encrypted chunks for a multipart upload
#[async_trait]
pub trait ChunkSource: Send {
    /// Total number of chunks the source will yield
    fn chunk_count(&self) -> u64;

    /// Next chunk in order, `None` when exhausted
    async fn next_chunk(&mut self) -> TransportResult<Option<Bytes>>;
}
