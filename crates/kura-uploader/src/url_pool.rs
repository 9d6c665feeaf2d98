//! Pool of pre-signed upload slots
//!
//! Single-object URLs are fetched in batches of two per file still in need of slots (the
//! file being processed included), capped by `max_upload_url_request`. The pool lock is held
//! across a refill, so callers that find the pool empty while a fetch is in flight wait for
//! that fetch instead of issuing their own. Pre-signed URLs expire, so leftovers are dropped
//! when a new batch starts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kura_api_client::{ApiError, RemoteApi};
use kura_core::models::{MultipartUploadUrls, UploadUrl};
use tokio::sync::Mutex;

pub struct UploadUrlPool {
    api: Arc<dyn RemoteApi>,
    max_request: usize,
    urls: Mutex<VecDeque<UploadUrl>>,
    pending_files: AtomicUsize,
}

impl UploadUrlPool {
    pub fn new(api: Arc<dyn RemoteApi>, max_request: usize) -> Self {
        Self {
            api,
            max_request: max_request.max(1),
            urls: Mutex::new(VecDeque::new()),
            pending_files: AtomicUsize::new(0),
        }
    }

    /// Number of files that still need slots; drives the refill size
    pub fn set_pending_files(&self, count: usize) {
        self.pending_files.store(count, Ordering::Relaxed);
    }

    /// Drop every pooled URL. Returns how many were discarded.
    pub async fn clear(&self) -> usize {
        let mut urls = self.urls.lock().await;
        let dropped = urls.len();
        urls.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded leftover upload URLs");
        }
        dropped
    }

    pub fn file_started(&self) {
        let _ = self
            .pending_files
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Thumbnail and body slot for the file in hand plus every file still queued
    pub fn refill_size(&self) -> usize {
        let pending = self.pending_files.load(Ordering::Relaxed);
        pending
            .saturating_add(1)
            .saturating_mul(2)
            .min(self.max_request)
    }

    #[cfg(test)]
    async fn available(&self) -> usize {
        self.urls.lock().await.len()
    }

    /// Take one single-object slot, refilling first when the pool is empty
    pub async fn acquire(&self) -> Result<UploadUrl, ApiError> {
        let mut urls = self.urls.lock().await;
        if urls.is_empty() {
            let count = self.refill_size();
            let fetched = self.api.fetch_upload_urls(count).await?;
            tracing::debug!(
                requested = count,
                received = fetched.len(),
                "Refilled upload URL pool"
            );
            urls.extend(fetched);
        }
        urls.pop_front()
            .ok_or_else(|| ApiError::Decode("server returned no upload URLs".to_string()))
    }

    /// Fetch a multipart slot for `part_count` parts. These are not pooled because every
    /// file needs a different part count.
    pub async fn acquire_multipart(&self, part_count: usize) -> Result<MultipartUploadUrls, ApiError> {
        let slot = self.api.fetch_multipart_upload_urls(part_count).await?;
        if slot.part_urls.len() != part_count {
            return Err(ApiError::Decode(format!(
                "requested {} part URLs, got {}",
                part_count,
                slot.part_urls.len()
            )));
        }
        Ok(slot)
    }
}
