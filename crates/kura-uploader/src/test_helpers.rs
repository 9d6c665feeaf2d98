//! In-memory fakes for the remote service, blob store, thumbnailer, local index and encryption
//! actors

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use kura_api_client::{ApiError, ApiResult, RemoteApi};
use kura_core::config::{RetryConfig, UploaderConfig};
use kura_core::models::{
    CollectionDiff, CollectionId, FileSource, FileTypeInfo, FileUploadResult, IndexedFile, LocalId,
    MultipartUploadUrls, RemoteFile, UploadFileRequest, UploadStage, UploadUrl,
};
use kura_core::UploadError;
use kura_processing::{Thumbnail, ThumbnailGenerator};
use kura_storage::{ProgressFn, Transport, TransportError, TransportResult};

use crate::crypto_worker::{CryptoWorker, CryptoWorkerFactory};
use crate::local_index::LocalFileIndex;
use crate::observer::UploadObserver;

const BLOB_HOST: &str = "https://blob.test";

pub fn test_config() -> UploaderConfig {
    UploaderConfig {
        auth_token: Some("test-token".to_string()),
        retry: RetryConfig {
            max_attempts: 1,
            backoff_ms: Vec::new(),
        },
        ..UploaderConfig::default()
    }
}

/// PNG of noisy pixels, so it does not compress away
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut seed: u32 = width.wrapping_mul(31).wrapping_add(height);
    let img = image::RgbImage::from_fn(width, height, |_, _| {
        let mut next = || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) as u8
        };
        image::Rgb([next(), next(), next()])
    });
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// QuickTime header followed by filler
pub fn mov_bytes() -> Vec<u8> {
    let mut data = vec![0, 0, 0, 0x14];
    data.extend_from_slice(b"ftypqt  ");
    data.extend_from_slice(&[0u8; 8]);
    data.extend((0..200u32).map(|i| (i % 251) as u8));
    data
}

/// Highest number of assets seen between their thumbnail request and their final result
#[derive(Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlightGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

fn object_url(object_key: &str) -> String {
    format!("{}/{}", BLOB_HOST, object_key)
}

#[derive(Default)]
pub struct FakeApi {
    next_key: AtomicU64,
    next_file_id: AtomicI64,
    no_token: AtomicBool,
    session_expired: AtomicBool,
    quota_exceeded: AtomicBool,
    url_fetches: Mutex<Vec<usize>>,
    registered: Mutex<Vec<UploadFileRequest>>,
    remote: Mutex<Vec<RemoteFile>>,
}

impl FakeApi {
    pub fn url_fetches(&self) -> Vec<usize> {
        self.url_fetches.lock().unwrap().clone()
    }

    pub fn registered(&self) -> Vec<UploadFileRequest> {
        self.registered.lock().unwrap().clone()
    }

    pub fn remote_files(&self) -> Vec<RemoteFile> {
        self.remote.lock().unwrap().clone()
    }

    pub fn set_remote_files(&self, files: Vec<RemoteFile>) {
        *self.remote.lock().unwrap() = files;
    }

    pub fn expire_session(&self) {
        self.session_expired.store(true, Ordering::SeqCst);
    }

    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.quota_exceeded.store(exceeded, Ordering::SeqCst);
    }

    pub fn clear_token(&self) {
        self.no_token.store(true, Ordering::SeqCst);
    }

    fn object_key(&self) -> String {
        format!("obj-{}", self.next_key.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    fn has_token(&self) -> bool {
        !self.no_token.load(Ordering::SeqCst)
    }

    async fn fetch_upload_urls(&self, count: usize) -> ApiResult<Vec<UploadUrl>> {
        self.url_fetches.lock().unwrap().push(count);
        Ok((0..count)
            .map(|_| {
                let object_key = self.object_key();
                UploadUrl {
                    url: object_url(&object_key),
                    object_key,
                }
            })
            .collect())
    }

    async fn fetch_multipart_upload_urls(
        &self,
        part_count: usize,
    ) -> ApiResult<MultipartUploadUrls> {
        let object_key = self.object_key();
        let base = object_url(&object_key);
        Ok(MultipartUploadUrls {
            part_urls: (1..=part_count)
                .map(|n| format!("{}/part/{}", base, n))
                .collect(),
            complete_url: format!("{}/complete", base),
            object_key,
        })
    }

    async fn register_file(&self, request: &UploadFileRequest) -> ApiResult<RemoteFile> {
        if self.session_expired.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 401,
                body: "token expired".to_string(),
            });
        }
        if self.quota_exceeded.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 402,
                body: "storage limit exceeded".to_string(),
            });
        }
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst) + 1;
        let file = RemoteFile {
            id,
            collection_id: request.collection_id,
            owner_id: Some(1),
            encrypted_key: request.encrypted_key.clone(),
            key_decryption_nonce: request.key_decryption_nonce.clone(),
            metadata: Some(request.metadata.clone()),
            is_deleted: false,
            updation_time: id * 1_000,
        };
        self.registered.lock().unwrap().push(request.clone());
        self.remote.lock().unwrap().push(file.clone());
        Ok(file)
    }

    async fn fetch_collection_diff(
        &self,
        collection_id: CollectionId,
        since_time: i64,
    ) -> ApiResult<CollectionDiff> {
        let diff = self
            .remote
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.collection_id == collection_id && f.updation_time > since_time)
            .cloned()
            .collect();
        Ok(CollectionDiff {
            diff,
            has_more: false,
        })
    }
}

/// Blob store keyed by object key. Multipart parts are joined on completion.
#[derive(Default)]
pub struct FakeTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    parts: Mutex<HashMap<String, BTreeMap<usize, Bytes>>>,
    manifests: Mutex<Vec<String>>,
    part_attempts: AtomicUsize,
    omit_etags: bool,
    delay: Option<Duration>,
}

impl FakeTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Parts are accepted but acknowledged without an ETag
    pub fn without_etags() -> Self {
        Self {
            omit_etags: true,
            ..Self::default()
        }
    }

    pub fn part_attempts(&self) -> usize {
        self.part_attempts.load(Ordering::SeqCst)
    }

    pub fn object(&self, object_key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(object_key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn manifests(&self) -> Vec<String> {
        self.manifests.lock().unwrap().clone()
    }
}

fn key_of(url: &str) -> String {
    url.trim_start_matches(BLOB_HOST)
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Transport for FakeTransport {
    async fn put_object(
        &self,
        url: &str,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(progress) = progress {
            progress(body.len() as u64);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key_of(url), body.to_vec());
        Ok(())
    }

    async fn put_part(
        &self,
        url: &str,
        part_number: usize,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> TransportResult<String> {
        self.part_attempts.fetch_add(1, Ordering::SeqCst);
        if self.omit_etags {
            return Err(TransportError::EtagMissing { part_number });
        }
        if let Some(progress) = progress {
            progress(body.len() as u64);
        }
        self.parts
            .lock()
            .unwrap()
            .entry(key_of(url))
            .or_default()
            .insert(part_number, body);
        Ok(format!("etag-{}", part_number))
    }

    async fn complete_multipart(&self, url: &str, manifest_xml: String) -> TransportResult<()> {
        let key = key_of(url);
        let parts = self.parts.lock().unwrap().remove(&key).unwrap_or_default();
        let joined: Vec<u8> = parts.values().flat_map(|p| p.iter().copied()).collect();
        self.objects.lock().unwrap().insert(key, joined);
        self.manifests.lock().unwrap().push(manifest_xml);
        Ok(())
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Callbacks run on the n-th thumbnail request
#[derive(Clone, Default)]
pub struct CallHook {
    inner: Arc<Mutex<Vec<(usize, Hook)>>>,
}

impl CallHook {
    pub fn set(&self, call: usize, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().unwrap().push((call, Box::new(hook)));
    }

    fn fire(&self, call: usize) {
        for (at, hook) in self.inner.lock().unwrap().iter() {
            if *at == call {
                hook();
            }
        }
    }
}

#[derive(Default)]
pub struct FakeThumbnailer {
    calls: Mutex<Vec<String>>,
    fail_once: Mutex<Option<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    panic_on: Option<String>,
    gauge: Option<Arc<InFlightGauge>>,
    hook: CallHook,
}

impl FakeThumbnailer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing_once(name: &str) -> Self {
        Self {
            fail_once: Mutex::new(Some(name.to_string())),
            ..Self::default()
        }
    }

    pub fn panicking_on(name: &str) -> Self {
        Self {
            panic_on: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn tracking(delay: Duration, gauge: Arc<InFlightGauge>) -> Self {
        Self {
            delay: Some(delay),
            gauge: Some(gauge),
            ..Self::default()
        }
    }

    pub fn call_hook(&self) -> CallHook {
        self.hook.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThumbnailGenerator for FakeThumbnailer {
    async fn generate(&self, source: &FileSource, _type_info: &FileTypeInfo) -> Result<Thumbnail> {
        let name = source.name();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(name.clone());
            calls.len()
        };
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if self.panic_on.as_deref() == Some(name.as_str()) {
            panic!("thumbnail decoder aborted on {}", name);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.hook.fire(call);

        let mut fail_once = self.fail_once.lock().unwrap();
        if fail_once.as_deref() == Some(name.as_str()) {
            *fail_once = None;
            return Err(anyhow!("decoder crashed on {}", name));
        }
        Ok(Thumbnail {
            data: format!("thumb:{}", name).into_bytes(),
            has_static_thumbnail: false,
        })
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    stages: Mutex<Vec<UploadStage>>,
    gauge: Option<Arc<InFlightGauge>>,
}

impl RecordingObserver {
    pub fn tracking(gauge: Arc<InFlightGauge>) -> Self {
        Self {
            gauge: Some(gauge),
            ..Self::default()
        }
    }

    pub fn stages(&self) -> Vec<UploadStage> {
        self.stages.lock().unwrap().clone()
    }
}

impl UploadObserver for RecordingObserver {
    fn on_stage(&self, stage: UploadStage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_file_result(&self, _local_id: LocalId, _title: &str, _result: FileUploadResult) {
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
    }
}

pub struct FailingCryptoFactory;

impl CryptoWorkerFactory for FailingCryptoFactory {
    fn spawn(&self, name: &str) -> Result<CryptoWorker, UploadError> {
        Err(UploadError::EncryptionActorUnavailable(format!(
            "cannot start {}",
            name
        )))
    }
}

/// Loads empty and refuses every write
pub struct FailingFileIndex;

#[async_trait]
impl LocalFileIndex for FailingFileIndex {
    async fn load(&self) -> Result<Vec<IndexedFile>> {
        Ok(Vec::new())
    }

    async fn persist(&self, _files: &[IndexedFile]) -> Result<()> {
        Err(anyhow!("disk full"))
    }
}
