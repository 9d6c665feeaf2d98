//! HTTP transport over reqwest
//!
//! Bodies are streamed in small slices so progress can be observed. A watchdog fails the
//! request with [`TransportError::Stalled`] when no slice has been pulled for the stale
//! window; once the whole body is out, only the request timeout applies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kura_core::config::UploaderConfig;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Client, RequestBuilder, Response};

use crate::traits::{ProgressFn, Transport, TransportError, TransportResult};

const BODY_SLICE_BYTES: usize = 64 * 1024;
const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// Tracks the last time a request made progress
#[derive(Clone)]
pub struct StallDetector {
    inner: Arc<StallState>,
}

struct StallState {
    origin: Instant,
    last_progress_ms: AtomicU64,
    finished: AtomicBool,
    timeout: Duration,
}

impl StallDetector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StallState {
                origin: Instant::now(),
                last_progress_ms: AtomicU64::new(0),
                finished: AtomicBool::new(false),
                timeout,
            }),
        }
    }

    pub fn touch(&self) {
        let now = self.inner.origin.elapsed().as_millis() as u64;
        self.inner.last_progress_ms.store(now, Ordering::Relaxed);
    }

    /// Disarm the watchdog once everything has been sent
    pub fn finish(&self) {
        self.inner.finished.store(true, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let now = self.inner.origin.elapsed().as_millis() as u64;
        let last = self.inner.last_progress_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Resolves with the idle time once the stale window has passed without progress
    pub async fn stalled(&self) -> Duration {
        let tick = (self.inner.timeout / 4).max(MIN_WATCHDOG_TICK);
        loop {
            tokio::time::sleep(tick).await;
            if self.inner.finished.load(Ordering::Relaxed) {
                continue;
            }
            let idle = self.idle();
            if idle >= self.inner.timeout {
                return idle;
            }
        }
    }
}

pub struct HttpTransport {
    client: Client,
    stale_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, stale_timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::InvalidRequest(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            stale_timeout,
        })
    }

    pub fn from_config(config: &UploaderConfig) -> TransportResult<Self> {
        Self::new(config.request_timeout(), config.stale_request_timeout())
    }

    fn progress_body(
        body: Bytes,
        progress: Option<ProgressFn>,
        detector: StallDetector,
    ) -> reqwest::Body {
        let total = body.len();
        if total == 0 {
            detector.finish();
        }
        let slices: Vec<Bytes> = (0..total)
            .step_by(BODY_SLICE_BYTES)
            .map(|start| body.slice(start..(start + BODY_SLICE_BYTES).min(total)))
            .collect();

        let mut sent = 0usize;
        let stream = futures::stream::iter(slices).map(move |slice| {
            sent += slice.len();
            detector.touch();
            if sent >= total {
                detector.finish();
            }
            if let Some(progress) = &progress {
                progress(sent as u64);
            }
            Ok::<Bytes, std::io::Error>(slice)
        });
        reqwest::Body::wrap_stream(stream)
    }

    /// PUT `body` under the stale watchdog and return the successful response
    async fn put_watched(
        &self,
        url: &str,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<Response> {
        let detector = StallDetector::new(self.stale_timeout);
        let len = body.len();
        let request = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(Self::progress_body(body, progress, detector.clone()));

        let response = self.send_watched(request, &detector).await?;
        check_status(response).await
    }

    async fn send_watched(
        &self,
        request: RequestBuilder,
        detector: &StallDetector,
    ) -> TransportResult<Response> {
        tokio::select! {
            response = request.send() => Ok(response?),
            idle = detector.stalled() => {
                tracing::warn!(
                    idle_ms = idle.as_millis(),
                    "Upload request stalled, aborting"
                );
                Err(TransportError::Stalled(idle))
            }
        }
    }
}

async fn check_status(response: Response) -> TransportResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn put_object(
        &self,
        url: &str,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<()> {
        let start = Instant::now();
        let size = body.len();
        self.put_watched(url, body, progress).await?;
        tracing::debug!(
            size_bytes = size,
            duration_ms = start.elapsed().as_millis(),
            "Object PUT completed"
        );
        Ok(())
    }

    async fn put_part(
        &self,
        url: &str,
        part_number: usize,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<String> {
        let start = Instant::now();
        let size = body.len();
        let response = self.put_watched(url, body, progress).await?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
            .ok_or(TransportError::EtagMissing { part_number })?;

        tracing::debug!(
            part_number = part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_millis(),
            "Part PUT completed"
        );
        Ok(etag)
    }

    async fn complete_multipart(&self, url: &str, manifest_xml: String) -> TransportResult<()> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/xml")
            .body(manifest_xml)
            .send()
            .await?;
        check_status(response).await?;
        tracing::debug!("Multipart completion accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(10), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_put_object_success_reports_progress() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/objects/abc")
            .match_body(mockito::Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let progress: ProgressFn = Arc::new(move |sent| seen_clone.lock().unwrap().push(sent));

        let body = Bytes::from(vec![9u8; 150 * 1024]);
        transport()
            .put_object(
                &format!("{}/objects/abc", server.url()),
                body,
                Some(progress),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some(150 * 1024));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_put_object_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/objects/abc")
            .with_status(503)
            .with_body("slow down")
            .create_async()
            .await;

        let err = transport()
            .put_object(
                &format!("{}/objects/abc", server.url()),
                Bytes::from_static(b"data"),
                None,
            )
            .await
            .unwrap_err();

        match err {
            TransportError::Status { status, ref body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_put_part_returns_unquoted_etag() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/part/1")
            .with_status(200)
            .with_header("ETag", "\"9b2cf535f27731c974343645a3985328\"")
            .create_async()
            .await;

        let etag = transport()
            .put_part(
                &format!("{}/part/1", server.url()),
                1,
                Bytes::from_static(b"part"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(etag, "9b2cf535f27731c974343645a3985328");
    }

    #[tokio::test]
    async fn test_put_part_without_etag_fails() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/part/2")
            .with_status(200)
            .create_async()
            .await;

        let err = transport()
            .put_part(
                &format!("{}/part/2", server.url()),
                2,
                Bytes::from_static(b"part"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EtagMissing { part_number: 2 }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_complete_multipart_posts_xml() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/complete")
            .match_header("content-type", "text/xml")
            .match_body(mockito::Matcher::Regex("<PartNumber>1</PartNumber>".to_string()))
            .with_status(200)
            .create_async()
            .await;

        transport()
            .complete_multipart(
                &format!("{}/complete", server.url()),
                "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>x</ETag></Part></CompleteMultipartUpload>".to_string(),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stall_detector_fires_without_progress() {
        let detector = StallDetector::new(Duration::from_millis(40));
        let idle = tokio::time::timeout(Duration::from_secs(2), detector.stalled())
            .await
            .unwrap();
        assert!(idle >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_finished_detector_never_fires() {
        let detector = StallDetector::new(Duration::from_millis(20));
        detector.finish();
        let outcome = tokio::time::timeout(Duration::from_millis(150), detector.stalled()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_put_to_peer_that_stops_reading_is_stalled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept, then hold the socket open without reading a byte
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let transport =
            HttpTransport::new(Duration::from_secs(30), Duration::from_millis(300)).unwrap();
        // larger than the loopback socket buffers, so the sender has to block
        let body = Bytes::from(vec![7u8; 64 * 1024 * 1024]);

        let start = Instant::now();
        let err = transport
            .put_object(&format!("http://{}/objects/stuck", addr), body, None)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Stalled(idle) if idle >= Duration::from_millis(300)));
        assert!(err.is_retryable());
        assert!(start.elapsed() < Duration::from_secs(10));
        server.abort();
    }
}
