//! Domain calls of the metadata service used by the upload pipeline.

use async_trait::async_trait;
use kura_core::constants::COLLECTION_DIFF_PAGE_LIMIT;
use kura_core::models::{
    CollectionDiff, CollectionId, MultipartUploadUrls, RemoteFile, UploadFileRequest, UploadUrl,
};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::ApiClient;

#[derive(Debug, Deserialize)]
struct UploadUrlsResponse {
    urls: Vec<UploadUrl>,
}

#[derive(Debug, Deserialize)]
struct MultipartUploadUrlsResponse {
    urls: MultipartUploadUrls,
}

/// Remote calls the uploader depends on
#[async_trait]
pub trait RemoteApi: Send + Sync {
    fn has_token(&self) -> bool;

    /// Request `count` pre-signed single-object slots
    async fn fetch_upload_urls(&self, count: usize) -> ApiResult<Vec<UploadUrl>>;

    /// Request one multipart slot with `part_count` part URLs
    async fn fetch_multipart_upload_urls(&self, part_count: usize)
        -> ApiResult<MultipartUploadUrls>;

    /// Register an uploaded file and return the server record
    async fn register_file(&self, request: &UploadFileRequest) -> ApiResult<RemoteFile>;

    /// One page of files changed in `collection_id` after `since_time` (microseconds).
    /// Without a token this is a no-op returning an empty page.
    async fn fetch_collection_diff(
        &self,
        collection_id: CollectionId,
        since_time: i64,
    ) -> ApiResult<CollectionDiff>;
}

#[async_trait]
impl RemoteApi for ApiClient {
    fn has_token(&self) -> bool {
        ApiClient::has_token(self)
    }

    async fn fetch_upload_urls(&self, count: usize) -> ApiResult<Vec<UploadUrl>> {
        let response: UploadUrlsResponse = self
            .get("/files/upload-urls", &[("count", count.to_string())])
            .await?;
        tracing::debug!(
            requested = count,
            received = response.urls.len(),
            "Fetched upload URLs"
        );
        Ok(response.urls)
    }

    async fn fetch_multipart_upload_urls(
        &self,
        part_count: usize,
    ) -> ApiResult<MultipartUploadUrls> {
        let response: MultipartUploadUrlsResponse = self
            .get(
                "/files/multipart-upload-urls",
                &[("count", part_count.to_string())],
            )
            .await?;
        tracing::debug!(parts = part_count, "Fetched multipart upload URLs");
        Ok(response.urls)
    }

    #[tracing::instrument(skip_all, fields(collection_id = request.collection_id))]
    async fn register_file(&self, request: &UploadFileRequest) -> ApiResult<RemoteFile> {
        let file: RemoteFile = self.post_json("/files", request).await?;
        tracing::debug!(file_id = file.id, "File registered");
        Ok(file)
    }

    async fn fetch_collection_diff(
        &self,
        collection_id: CollectionId,
        since_time: i64,
    ) -> ApiResult<CollectionDiff> {
        if !self.has_token() {
            tracing::debug!(collection_id, "No auth token, skipping collection diff");
            return Ok(CollectionDiff::default());
        }
        self.get(
            "/collections/v2/diff",
            &[
                ("collectionID", collection_id.to_string()),
                ("sinceTime", since_time.to_string()),
                ("limit", COLLECTION_DIFF_PAGE_LIMIT.to_string()),
            ],
        )
        .await
    }
}
