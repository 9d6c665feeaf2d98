//! Single and multipart object uploads
//!
//! A multipart upload groups `chunks_per_part` encrypted chunks into one part, PUTs the parts
//! strictly in order, and finishes with a completion manifest listing every part's ETag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use kura_core::models::{MultipartUploadUrls, UploadUrl};
use tokio_util::sync::CancellationToken;

use crate::retry::{retry_async, RetryPolicy};
use crate::traits::{ChunkSource, ProgressFn, Transport, TransportError, TransportResult};

/// Number of parts needed for `chunk_count` chunks
pub fn part_count(chunk_count: u64, chunks_per_part: usize) -> usize {
    let per_part = chunks_per_part.max(1) as u64;
    chunk_count.div_ceil(per_part) as usize
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: usize,
    pub etag: String,
}

/// Ordered list of acknowledged parts
#[derive(Debug, Clone, Default)]
pub struct MultipartManifest {
    parts: Vec<CompletedPart>,
}

impl MultipartManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, part_number: usize, etag: impl Into<String>) {
        self.parts.push(CompletedPart {
            part_number,
            etag: etag.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// S3-style completion document
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for part in &self.parts {
            xml.push_str("<Part><PartNumber>");
            xml.push_str(&part.part_number.to_string());
            xml.push_str("</PartNumber><ETag>");
            xml.push_str(&escape_xml(&part.etag));
            xml.push_str("</ETag></Part>");
        }
        xml.push_str("</CompleteMultipartUpload>");
        xml
    }
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Executes uploads against pre-signed slots with per-request retries
#[derive(Clone)]
pub struct ObjectUploader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    chunks_per_part: usize,
}

impl ObjectUploader {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, chunks_per_part: usize) -> Self {
        Self {
            transport,
            retry,
            chunks_per_part: chunks_per_part.max(1),
        }
    }

    pub fn chunks_per_part(&self) -> usize {
        self.chunks_per_part
    }

    /// PUT a whole object and return its object key
    #[tracing::instrument(skip_all, fields(object_key = %slot.object_key, size_bytes = body.len()))]
    pub async fn put_single(
        &self,
        slot: &UploadUrl,
        body: Bytes,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
    ) -> TransportResult<String> {
        let transport = self.transport.clone();
        retry_async(&self.retry, cancel, "put_object", |_| {
            let transport = transport.clone();
            let body = body.clone();
            let progress = progress.clone();
            let url = slot.url.clone();
            async move { transport.put_object(&url, body, progress).await }
        })
        .await?;
        Ok(slot.object_key.clone())
    }

    /// Upload every chunk of `source` as parts of one multipart object.
    ///
    /// `slot` must carry exactly `part_count(source.chunk_count(), chunks_per_part)` part URLs.
    /// Parts are sent in order; an acknowledged part is never sent again. Cancellation is
    /// checked between parts.
    #[tracing::instrument(skip_all, fields(object_key = %slot.object_key, parts = slot.part_urls.len()))]
    pub async fn put_multipart(
        &self,
        slot: &MultipartUploadUrls,
        source: &mut dyn ChunkSource,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
    ) -> TransportResult<String> {
        let start = Instant::now();
        let expected_parts = part_count(source.chunk_count(), self.chunks_per_part);
        if slot.part_urls.len() != expected_parts {
            return Err(TransportError::InvalidRequest(format!(
                "expected {} part URLs, got {}",
                expected_parts,
                slot.part_urls.len()
            )));
        }

        let uploaded = Arc::new(AtomicU64::new(0));
        let mut manifest = MultipartManifest::new();

        for (index, part_url) in slot.part_urls.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let part_number = index + 1;
            let body = self.read_part(source).await?;
            if body.is_empty() {
                return Err(TransportError::Source(format!(
                    "source exhausted before part {}",
                    part_number
                )));
            }
            let part_len = body.len() as u64;

            let part_progress = progress.clone().map(|report| {
                let base = uploaded.load(Ordering::Relaxed);
                Arc::new(move |sent: u64| report(base + sent)) as ProgressFn
            });

            let transport = self.transport.clone();
            let etag = retry_async(&self.retry, cancel, "put_part", |_| {
                let transport = transport.clone();
                let body = body.clone();
                let progress = part_progress.clone();
                let url = part_url.clone();
                async move { transport.put_part(&url, part_number, body, progress).await }
            })
            .await?;

            uploaded.fetch_add(part_len, Ordering::Relaxed);
            manifest.push(part_number, etag);
        }

        if source.next_chunk().await?.is_some() {
            return Err(TransportError::Source(
                "source yielded more chunks than announced".to_string(),
            ));
        }

        let manifest_xml = manifest.to_xml();
        let transport = self.transport.clone();
        retry_async(&self.retry, cancel, "complete_multipart", |_| {
            let transport = transport.clone();
            let xml = manifest_xml.clone();
            let url = slot.complete_url.clone();
            async move { transport.complete_multipart(&url, xml).await }
        })
        .await?;

        tracing::info!(
            parts = manifest.len(),
            size_bytes = uploaded.load(Ordering::Relaxed),
            duration_ms = start.elapsed().as_millis(),
            "Multipart upload completed"
        );
        Ok(slot.object_key.clone())
    }

    /// Concatenate up to `chunks_per_part` chunks
    async fn read_part(&self, source: &mut dyn ChunkSource) -> TransportResult<Bytes> {
        let mut part = BytesMut::new();
        for _ in 0..self.chunks_per_part {
            match source.next_chunk().await? {
                Some(chunk) => part.extend_from_slice(&chunk),
                None => break,
            }
        }
        Ok(part.freeze())
    }
}
