use serde::{Deserialize, Serialize};

/// Terminal outcome of one asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileUploadResult {
    Uploaded,
    AlreadyUploaded,
    Unsupported,
    TooLarge,
    Blocked,
    Failed,
}

impl FileUploadResult {
    /// Whether a later retry pass picks the asset up again
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, FileUploadResult::Failed | FileUploadResult::Blocked)
    }
}

/// Batch phase surfaced to observers. Only ever moves forward within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStage {
    Start,
    ReadingSidecarMetadata,
    Uploading,
    Finish,
}

/// Pre-signed single object slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub url: String,
    pub object_key: String,
}

/// Pre-signed multipart slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUploadUrls {
    #[serde(rename = "objectKey")]
    pub object_key: String,
    #[serde(rename = "partURLs")]
    pub part_urls: Vec<String>,
    #[serde(rename = "completeURL")]
    pub complete_url: String,
}
