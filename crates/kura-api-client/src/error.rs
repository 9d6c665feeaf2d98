use kura_core::UploadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No auth token available")]
    NoToken,

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API request timed out")]
    Timeout,

    #[error("Failed to send request: {0}")]
    Connection(String),

    #[error("Failed to parse response as JSON: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ApiError::Timeout | ApiError::Connection(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if err.is_builder() {
            ApiError::InvalidRequest(err.to_string())
        } else {
            ApiError::Connection(err.to_string())
        }
    }
}

impl From<ApiError> for UploadError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NoToken => UploadError::NoAuthToken,
            ApiError::Status { status: 401, .. } => UploadError::SessionExpired,
            ApiError::Status {
                status: 402 | 426,
                body,
            } => UploadError::QuotaExceeded(body),
            e if e.is_transient() => UploadError::Network(e.to_string()),
            e => UploadError::Api(e.to_string()),
        }
    }
}
