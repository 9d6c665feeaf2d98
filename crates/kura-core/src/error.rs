//! Error types module
//!
//! `UploadError` is the pipeline-level error. Component crates (crypto, transport, API client)
//! keep their own error enums and convert into it at the pipeline boundary. Every variant maps
//! to exactly one taxonomy code through [`ErrorMetadata`], which is what the result classifier
//! and the manager's fatal-error handling look at.

use std::io;

use crate::encryption::CryptoError;
use crate::models::FileUploadResult;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected outcomes like dedup skips
    Debug,
    /// Warning level - for per-asset failures the batch survives
    Warn,
    /// Error level - for failures that stop the batch
    Error,
}

/// Closed failure taxonomy. One code per terminal asset outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnsupportedFormat,
    TooLarge,
    AlreadyUploaded,
    EtagMissing,
    SubscriptionOrQuotaExceeded,
    SessionExpired,
    NetworkTransient,
    Failed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::TooLarge => "TOO_LARGE",
            ErrorCode::AlreadyUploaded => "ALREADY_UPLOADED",
            ErrorCode::EtagMissing => "ETAG_MISSING",
            ErrorCode::SubscriptionOrQuotaExceeded => "SUBSCRIPTION_OR_QUOTA_EXCEEDED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::NetworkTransient => "NETWORK_TRANSIENT",
            ErrorCode::Failed => "FAILED",
        }
    }

    /// Terminal per-file result for an asset that ended with this code.
    pub fn upload_result(self) -> FileUploadResult {
        match self {
            ErrorCode::UnsupportedFormat => FileUploadResult::Unsupported,
            ErrorCode::TooLarge => FileUploadResult::TooLarge,
            ErrorCode::AlreadyUploaded => FileUploadResult::AlreadyUploaded,
            ErrorCode::SubscriptionOrQuotaExceeded => FileUploadResult::Blocked,
            ErrorCode::EtagMissing
            | ErrorCode::SessionExpired
            | ErrorCode::NetworkTransient
            | ErrorCode::Failed => FileUploadResult::Failed,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing how an error is classified and surfaced.
pub trait ErrorMetadata {
    /// Taxonomy code for this error
    fn error_code(&self) -> ErrorCode;

    /// Whether a later retry pass may succeed
    fn is_recoverable(&self) -> bool;

    /// Whether the whole batch must stop (instead of just this asset)
    fn is_batch_fatal(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("Multipart part {part_number} was acknowledged without an ETag")]
    EtagMissing { part_number: usize },

    #[error("Subscription or storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Session expired, re-authentication required")]
    SessionExpired,

    #[error("No auth token available")]
    NoAuthToken,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Encryption actor unavailable: {0}")]
    EncryptionActorUnavailable(String),

    #[error("Encryption failed: {0}")]
    Encryption(#[from] CryptoError),

    #[error("Thumbnail generation failed: {0}")]
    Thumbnail(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Remote API error: {0}")]
    Api(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl From<anyhow::Error> for UploadError {
    fn from(err: anyhow::Error) -> Self {
        UploadError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

/// Static metadata for each variant: (code, recoverable, batch_fatal, log_level).
fn upload_error_static_metadata(err: &UploadError) -> (ErrorCode, bool, bool, LogLevel) {
    match err {
        UploadError::UnsupportedFormat(_) => {
            (ErrorCode::UnsupportedFormat, false, false, LogLevel::Debug)
        }
        UploadError::TooLarge { .. } => (ErrorCode::TooLarge, false, false, LogLevel::Debug),
        UploadError::EtagMissing { .. } => (ErrorCode::EtagMissing, true, false, LogLevel::Warn),
        UploadError::QuotaExceeded(_) => (
            ErrorCode::SubscriptionOrQuotaExceeded,
            true,
            false,
            LogLevel::Warn,
        ),
        UploadError::SessionExpired => (ErrorCode::SessionExpired, true, true, LogLevel::Error),
        UploadError::NoAuthToken => (ErrorCode::SessionExpired, true, true, LogLevel::Error),
        UploadError::Network(_) => (ErrorCode::NetworkTransient, true, false, LogLevel::Warn),
        UploadError::EncryptionActorUnavailable(_) => {
            (ErrorCode::Failed, true, true, LogLevel::Error)
        }
        UploadError::Encryption(_) => (ErrorCode::Failed, true, false, LogLevel::Warn),
        UploadError::Thumbnail(_) => (ErrorCode::Failed, true, false, LogLevel::Warn),
        UploadError::Storage(_) => (ErrorCode::Failed, true, false, LogLevel::Warn),
        UploadError::Api(_) => (ErrorCode::Failed, true, false, LogLevel::Warn),
        UploadError::Cancelled => (ErrorCode::Failed, true, false, LogLevel::Debug),
        UploadError::InvalidInput(_) => (ErrorCode::Failed, false, false, LogLevel::Warn),
        UploadError::Internal(_) => (ErrorCode::Failed, true, false, LogLevel::Error),
        UploadError::InternalWithSource { .. } => {
            (ErrorCode::Failed, true, false, LogLevel::Error)
        }
    }
}

impl UploadError {
    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }

    /// Terminal per-file result for an asset that failed with this error.
    pub fn upload_result(&self) -> FileUploadResult {
        self.error_code().upload_result()
    }
}

impl ErrorMetadata for UploadError {
    fn error_code(&self) -> ErrorCode {
        upload_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        upload_error_static_metadata(self).1
    }

    fn is_batch_fatal(&self) -> bool {
        upload_error_static_metadata(self).2
    }

    fn log_level(&self) -> LogLevel {
        upload_error_static_metadata(self).3
    }
}
