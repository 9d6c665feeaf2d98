//! Upload manager
//!
//! Drives a batch through `Idle -> Segregating -> ReadingSidecar -> Uploading -> Draining ->
//! Finish`. Sidecar JSON files are parsed before any media starts so extraction can consult
//! them. A fixed pool of workers, each owning its own encryption actor, then pulls assets from
//! a shared queue until it is empty or the batch is cancelled.
//!
//! The manager reports `Draining` once the queue is empty and only in-flight assets remain.
//! Per-asset failures are classified and recorded; the batch keeps going. An asset whose
//! worker panicked is recorded as failed. Failures that mean
//! no asset can succeed (no token, expired session, no encryption actor) cancel the batch and
//! are returned to the caller once the workers have stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use base64::{engine::general_purpose, Engine as _};
use kura_api_client::RemoteApi;
use kura_core::config::UploaderConfig;
use kura_core::models::{
    AssetPayload, Collection, ExtractedMetadata, FileType, FileUploadResult, IndexedFile,
    LocalId, RemoteFile, UploadAsset, UploadStage,
};
use kura_core::{decrypt_blob, unwrap_key, ErrorCode, ErrorMetadata, LogLevel, UploadError, WrappedKey};
use kura_processing::sidecar::sidecar_title_from_file_name;
use kura_processing::{
    cluster_live_photos, file_size, get_file_type, parse_sidecar, read_all, ClusterCandidate,
    MetadataExtractor, SidecarMetadataMap, ThumbnailGenerator,
};
use kura_storage::{ObjectUploader, RetryPolicy, Transport};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::crypto_worker::{CryptoWorker, CryptoWorkerFactory};
use crate::dedup::KnownFiles;
use crate::encryptor::EnvelopeEncryptor;
use crate::local_index::LocalFileIndex;
use crate::observer::{UploadCounters, UploadObserver};
use crate::pipeline::PipelineContext;
use crate::url_pool::UploadUrlPool;

/// Manager state within one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Segregating,
    ReadingSidecar,
    Uploading,
    Draining,
    Finish,
}

/// External collaborators of the manager
#[derive(Clone)]
pub struct UploadServices {
    pub api: Arc<dyn RemoteApi>,
    pub transport: Arc<dyn Transport>,
    pub thumbnailer: Arc<dyn ThumbnailGenerator>,
    pub crypto: Arc<dyn CryptoWorkerFactory>,
    pub index: Arc<dyn LocalFileIndex>,
    pub observer: Arc<dyn UploadObserver>,
}

/// Terminal result of one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetResult {
    pub local_id: LocalId,
    pub title: String,
    pub result: FileUploadResult,
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// One entry per asset that started, in completion order
    pub results: Vec<AssetResult>,
    /// Assets never started because the batch was cancelled
    pub not_started: Vec<LocalId>,
}

impl BatchSummary {
    pub fn count(&self, result: FileUploadResult) -> usize {
        self.results.iter().filter(|r| r.result == result).count()
    }

    pub fn result_of(&self, local_id: LocalId) -> Option<FileUploadResult> {
        self.results
            .iter()
            .find(|r| r.local_id == local_id)
            .map(|r| r.result)
    }

    /// Assets that failed or never started
    pub fn unfinished(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.result.is_retry_eligible())
            .count()
            + self.not_started.len()
    }
}

/// State shared by the workers of one batch
struct BatchState {
    queue: Mutex<VecDeque<UploadAsset>>,
    results: Mutex<Vec<(UploadAsset, AssetResult)>>,
    counters: Mutex<UploadCounters>,
    fatal: Mutex<Option<UploadError>>,
    /// Asset each worker is processing, keyed by worker index
    in_flight: Mutex<HashMap<usize, UploadAsset>>,
    state: Arc<StdMutex<ManagerState>>,
    cancel: CancellationToken,
}

impl BatchState {
    /// Nothing left to start; in-flight assets are finishing
    fn enter_draining(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == ManagerState::Uploading {
            *state = ManagerState::Draining;
            tracing::debug!(state = ?ManagerState::Draining, "Upload manager state");
        }
    }

    async fn record(&self, asset: UploadAsset, record: AssetResult) -> UploadCounters {
        let counters = {
            let mut counters = self.counters.lock().await;
            counters.finished += 1;
            if record.result.is_retry_eligible() {
                counters.failed += 1;
            }
            *counters
        };
        self.results.lock().await.push((asset, record));
        counters
    }
}

pub struct UploadManager {
    config: UploaderConfig,
    services: UploadServices,
    context: Arc<PipelineContext>,
    retry_set: Mutex<Vec<UploadAsset>>,
    current_cancel: StdMutex<CancellationToken>,
    state: Arc<StdMutex<ManagerState>>,
    stage: StdMutex<Option<UploadStage>>,
    batch_lock: Mutex<()>,
}

impl UploadManager {
    pub async fn new(config: UploaderConfig, services: UploadServices) -> Result<Self, UploadError> {
        config
            .validate()
            .map_err(|e| UploadError::InvalidInput(e.to_string()))?;

        let known_files = Arc::new(KnownFiles::load(services.index.clone()).await?);
        let url_pool = Arc::new(UploadUrlPool::new(
            services.api.clone(),
            config.max_upload_url_request,
        ));
        let uploader = ObjectUploader::new(
            services.transport.clone(),
            RetryPolicy::from(&config.retry),
            config.chunks_per_part,
        );

        let context = Arc::new(PipelineContext {
            config: config.clone(),
            api: services.api.clone(),
            url_pool,
            uploader,
            thumbnailer: services.thumbnailer.clone(),
            extractor: MetadataExtractor::new(
                config.ffprobe_path.clone(),
                config.thumbnail.timeout(),
            ),
            encryptor: EnvelopeEncryptor::new(
                config.encryption_chunk_size,
                config.multipart_threshold_bytes,
            ),
            known_files,
            sidecars: Arc::new(RwLock::new(SidecarMetadataMap::new())),
            collections: Arc::new(RwLock::new(HashMap::new())),
            observer: services.observer.clone(),
        });

        Ok(Self {
            config,
            services,
            context,
            retry_set: Mutex::new(Vec::new()),
            current_cancel: StdMutex::new(CancellationToken::new()),
            state: Arc::new(StdMutex::new(ManagerState::Idle)),
            stage: StdMutex::new(None),
            batch_lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ManagerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        tracing::debug!(state = ?state, "Upload manager state");
    }

    /// Stages only move forward within a batch
    fn set_stage(&self, stage: UploadStage) {
        let mut current = self.stage.lock().unwrap_or_else(|p| p.into_inner());
        if current.is_some_and(|c| c >= stage) {
            return;
        }
        *current = Some(stage);
        drop(current);
        self.services.observer.on_stage(stage);
    }

    /// Stop the running batch: no new asset starts, running ones stop at their next
    /// checkpoint.
    pub fn cancel(&self) {
        let token = self
            .current_cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        tracing::info!("Upload cancellation requested");
        token.cancel();
    }

    pub async fn register_collections(&self, collections: Vec<Collection>) {
        let mut known = self.context.collections.write().await;
        for collection in collections {
            known.insert(collection.id, collection);
        }
    }

    pub fn known_files(&self) -> Arc<KnownFiles> {
        self.context.known_files.clone()
    }

    /// Assets a later `retry_failed_files` would resubmit
    pub async fn retry_set(&self) -> Vec<LocalId> {
        self.retry_set.lock().await.iter().map(|a| a.local_id).collect()
    }

    /// Resubmit every failed, blocked or not-started asset of earlier batches
    pub async fn retry_failed_files(&self) -> Result<BatchSummary, UploadError> {
        let assets = std::mem::take(&mut *self.retry_set.lock().await);
        tracing::info!(assets = assets.len(), "Retrying failed files");
        self.queue_files_for_upload(assets, Vec::new()).await
    }

    /// Run a whole batch to completion.
    #[tracing::instrument(skip_all, fields(assets = assets.len()))]
    pub async fn queue_files_for_upload(
        &self,
        assets: Vec<UploadAsset>,
        new_collections: Vec<Collection>,
    ) -> Result<BatchSummary, UploadError> {
        let _batch = self.batch_lock.lock().await;
        let start = Instant::now();
        self.register_collections(new_collections).await;

        let cancel = CancellationToken::new();
        *self
            .current_cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = cancel.clone();
        *self.stage.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.set_stage(UploadStage::Start);

        if !self.services.api.has_token() {
            tracing::error!("No auth token, refusing to start upload batch");
            self.set_state(ManagerState::Idle);
            self.retry_set.lock().await.extend(assets);
            return Err(UploadError::NoAuthToken);
        }

        self.set_state(ManagerState::Segregating);
        let (sidecars, media): (Vec<_>, Vec<_>) =
            assets.into_iter().partition(UploadAsset::is_sidecar);

        if !sidecars.is_empty() {
            self.set_state(ManagerState::ReadingSidecar);
            self.set_stage(UploadStage::ReadingSidecarMetadata);
            self.read_sidecars(&sidecars).await;
        }

        let media = self.cluster(media).await;

        self.set_state(ManagerState::Uploading);
        self.set_stage(UploadStage::Uploading);
        let (summary, fatal, retryable) = self.run_workers(media, cancel).await;
        self.retry_set.lock().await.extend(retryable);

        self.set_state(ManagerState::Finish);
        self.set_stage(UploadStage::Finish);

        tracing::info!(
            uploaded = summary.count(FileUploadResult::Uploaded),
            already_uploaded = summary.count(FileUploadResult::AlreadyUploaded),
            failed = summary.count(FileUploadResult::Failed),
            blocked = summary.count(FileUploadResult::Blocked),
            unsupported = summary.count(FileUploadResult::Unsupported),
            too_large = summary.count(FileUploadResult::TooLarge),
            not_started = summary.not_started.len(),
            duration_ms = start.elapsed().as_millis(),
            "Upload batch finished"
        );

        match fatal {
            Some(e) => {
                tracing::error!(error = %e, "Upload batch aborted");
                Err(e)
            }
            None => Ok(summary),
        }
    }

    async fn read_sidecars(&self, sidecars: &[UploadAsset]) {
        let mut map = self.context.sidecars.write().await;
        for asset in sidecars {
            let AssetPayload::File(source) = &asset.payload else {
                continue;
            };
            let parsed = match read_all(source).await {
                Ok(data) => parse_sidecar(&data),
                Err(e) => Err(e),
            };
            match parsed {
                Ok((title, metadata)) => {
                    let title = title.unwrap_or_else(|| sidecar_title_from_file_name(&source.name()));
                    map.insert(asset.collection_id, title, metadata);
                }
                Err(e) => {
                    tracing::warn!(
                        local_id = asset.local_id,
                        file_name = %source.name(),
                        error = %e,
                        "Skipping unreadable sidecar"
                    );
                }
            }
        }
        tracing::info!(sidecars = map.len(), "Sidecar metadata loaded");
    }

    async fn cluster(&self, media: Vec<UploadAsset>) -> Vec<UploadAsset> {
        let mut candidates = Vec::with_capacity(media.len());
        for asset in media {
            let (file_type, size) = match &asset.payload {
                AssetPayload::File(source) => {
                    let file_type = get_file_type(source)
                        .await
                        .map(|info| info.file_type)
                        .unwrap_or(FileType::Other);
                    (file_type, file_size(source).await.unwrap_or(0))
                }
                AssetPayload::LivePhoto(_) => (FileType::LivePhoto, 0),
            };
            candidates.push(ClusterCandidate {
                asset,
                file_type,
                size,
            });
        }
        cluster_live_photos(candidates, self.config.live_photo_asset_size_limit)
    }

    async fn run_workers(
        &self,
        media: Vec<UploadAsset>,
        cancel: CancellationToken,
    ) -> (BatchSummary, Option<UploadError>, Vec<UploadAsset>) {
        let total = media.len();
        // slots left from an earlier batch may have expired
        self.context.url_pool.clear().await;
        self.context.url_pool.set_pending_files(total);
        let batch = Arc::new(BatchState {
            queue: Mutex::new(media.into_iter().collect()),
            results: Mutex::new(Vec::with_capacity(total)),
            counters: Mutex::new(UploadCounters {
                total,
                ..Default::default()
            }),
            fatal: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            state: self.state.clone(),
            cancel,
        });

        let worker_count = self.config.max_concurrent_uploads.min(total);
        let mut workers = JoinSet::new();
        for index in 0..worker_count {
            let actor = match self.services.crypto.spawn(&format!("kura-crypto-{}", index)) {
                Ok(actor) => actor,
                Err(e) => {
                    tracing::error!(worker = index, error = %e, "Failed to start encryption actor");
                    record_fatal(&batch, e).await;
                    break;
                }
            };
            let context = self.context.clone();
            let batch = batch.clone();
            workers.spawn(async move { run_worker(index, context, actor, batch).await });
        }
        tracing::info!(workers = workers.len(), assets = total, "Upload workers started");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Upload worker panicked");
            }
        }

        // whatever is still in flight belonged to a worker that panicked
        let orphaned: Vec<UploadAsset> = batch
            .in_flight
            .lock()
            .await
            .drain()
            .map(|(_, asset)| asset)
            .collect();
        for asset in orphaned {
            tracing::error!(local_id = asset.local_id, "Asset lost with its worker, marking failed");
            let record = AssetResult {
                local_id: asset.local_id,
                title: asset.title(),
                result: FileUploadResult::Failed,
                error_code: Some(ErrorCode::Failed),
            };
            self.services
                .observer
                .on_file_result(record.local_id, &record.title, record.result);
            let counters = batch.record(asset, record).await;
            self.services.observer.on_counters(counters);
        }

        let not_started: Vec<UploadAsset> = batch.queue.lock().await.drain(..).collect();
        let results = std::mem::take(&mut *batch.results.lock().await);
        let fatal = batch.fatal.lock().await.take();

        let mut retryable = Vec::new();
        let mut summary = BatchSummary::default();
        for (asset, result) in results {
            if result.result.is_retry_eligible() {
                retryable.push(asset);
            }
            summary.results.push(result);
        }
        if !not_started.is_empty() {
            tracing::info!(not_started = not_started.len(), "Assets left unstarted");
        }
        summary.not_started = not_started.iter().map(|a| a.local_id).collect();
        retryable.extend(not_started);

        (summary, fatal, retryable)
    }

    /// Merge remote changes of `collection` into the known-files index so dedup also sees
    /// files uploaded elsewhere. Returns the number of files merged.
    #[tracing::instrument(skip_all, fields(collection_id = collection.id))]
    pub async fn sync_collection(&self, collection: &Collection) -> Result<usize, UploadError> {
        self.register_collections(vec![collection.clone()]).await;
        let known = &self.context.known_files;
        let mut since = known.latest_update(collection.id).await;
        let mut merged = 0;

        loop {
            let page = self
                .services
                .api
                .fetch_collection_diff(collection.id, since)
                .await?;

            let mut updated = Vec::new();
            let mut removed = Vec::new();
            for file in &page.diff {
                since = since.max(file.updation_time);
                if file.is_deleted {
                    removed.push((file.collection_id, file.id));
                    continue;
                }
                match decrypt_remote_metadata(file, collection) {
                    Ok(metadata) => updated.push(IndexedFile {
                        id: file.id,
                        collection_id: collection.id,
                        metadata,
                        updation_time: file.updation_time,
                    }),
                    Err(e) => {
                        tracing::warn!(file_id = file.id, error = %e, "Skipping undecryptable remote file");
                    }
                }
            }
            merged += updated.len();
            known.apply(updated, &removed).await?;

            if !page.has_more || page.diff.is_empty() {
                break;
            }
        }

        tracing::info!(merged, "Collection synced");
        Ok(merged)
    }
}

fn decrypt_remote_metadata(
    file: &RemoteFile,
    collection: &Collection,
) -> Result<ExtractedMetadata, UploadError> {
    let metadata = file
        .metadata
        .as_ref()
        .ok_or_else(|| UploadError::InvalidInput("remote file has no metadata".to_string()))?;
    let file_key = unwrap_key(
        &WrappedKey {
            encrypted_key: file.encrypted_key.clone(),
            key_decryption_nonce: file.key_decryption_nonce.clone(),
        },
        &collection.key,
    )?;
    let ciphertext = general_purpose::STANDARD
        .decode(&metadata.encrypted_data)
        .map_err(|e| UploadError::InvalidInput(format!("metadata is not base64: {}", e)))?;
    let plain = decrypt_blob(&ciphertext, &metadata.decryption_header, &file_key)?;
    Ok(serde_json::from_slice(&plain)?)
}

async fn record_fatal(batch: &BatchState, error: UploadError) {
    let mut fatal = batch.fatal.lock().await;
    if fatal.is_none() {
        *fatal = Some(error);
    }
    batch.cancel.cancel();
}

async fn run_worker(
    index: usize,
    context: Arc<PipelineContext>,
    actor: CryptoWorker,
    batch: Arc<BatchState>,
) {
    loop {
        if batch.cancel.is_cancelled() {
            batch.enter_draining();
            break;
        }
        let next = {
            let mut queue = batch.queue.lock().await;
            let next = queue.pop_front();
            if queue.is_empty() {
                batch.enter_draining();
            }
            next
        };
        let Some(asset) = next else {
            break;
        };
        batch.in_flight.lock().await.insert(index, asset.clone());
        context.url_pool.file_started();

        let title = asset.title();
        let outcome = context.upload_asset(&asset, &actor, &batch.cancel).await;
        let (result, error_code) = match outcome {
            Ok(result) => (result, None),
            Err(e) => {
                match e.log_level() {
                    LogLevel::Debug => tracing::debug!(
                        worker = index,
                        local_id = asset.local_id,
                        code = %e.error_code(),
                        error = %e,
                        "Asset not uploaded"
                    ),
                    LogLevel::Warn => tracing::warn!(
                        worker = index,
                        local_id = asset.local_id,
                        code = %e.error_code(),
                        recoverable = e.is_recoverable(),
                        error = %e.detailed_message(),
                        "Asset upload failed"
                    ),
                    LogLevel::Error => tracing::error!(
                        worker = index,
                        local_id = asset.local_id,
                        code = %e.error_code(),
                        recoverable = e.is_recoverable(),
                        error = %e.detailed_message(),
                        "Asset upload failed"
                    ),
                }
                let classified = (e.upload_result(), Some(e.error_code()));
                if e.is_batch_fatal() {
                    record_fatal(&batch, e).await;
                }
                classified
            }
        };

        context.observer.on_file_result(asset.local_id, &title, result);
        batch.in_flight.lock().await.remove(&index);
        let record = AssetResult {
            local_id: asset.local_id,
            title,
            result,
            error_code,
        };
        let counters = batch.record(asset, record).await;
        context.observer.on_counters(counters);
    }
    tracing::debug!(worker = index, "Upload worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_worker::ThreadCryptoWorkerFactory;
    use crate::local_index::MemoryFileIndex;
    use crate::test_helpers::*;
    use kura_core::models::{CollectionId, FileSource};
    use kura_core::{ChunkDecryptor, SymmetricKey};
    use std::io::Read;

    const COLLECTION: CollectionId = 7;

    struct Harness {
        api: Arc<FakeApi>,
        transport: Arc<FakeTransport>,
        thumbnailer: Arc<FakeThumbnailer>,
        observer: Arc<RecordingObserver>,
        collection: Collection,
        manager: Arc<UploadManager>,
    }

    struct Fakes {
        thumbnailer: FakeThumbnailer,
        transport: FakeTransport,
        observer: RecordingObserver,
        crypto: Arc<dyn CryptoWorkerFactory>,
        index: Arc<dyn LocalFileIndex>,
    }

    impl Default for Fakes {
        fn default() -> Self {
            Self {
                thumbnailer: FakeThumbnailer::default(),
                transport: FakeTransport::default(),
                observer: RecordingObserver::default(),
                crypto: Arc::new(ThreadCryptoWorkerFactory),
                index: Arc::new(MemoryFileIndex::new()),
            }
        }
    }

    async fn harness_from(config: UploaderConfig, fakes: Fakes) -> Harness {
        let api = Arc::new(FakeApi::default());
        let transport = Arc::new(fakes.transport);
        let thumbnailer = Arc::new(fakes.thumbnailer);
        let observer = Arc::new(fakes.observer);
        let services = UploadServices {
            api: api.clone(),
            transport: transport.clone(),
            thumbnailer: thumbnailer.clone(),
            crypto: fakes.crypto,
            index: fakes.index,
            observer: observer.clone(),
        };
        let manager = Arc::new(UploadManager::new(config, services).await.unwrap());
        let collection = Collection {
            id: COLLECTION,
            key: SymmetricKey::generate(),
            name: "Holidays".to_string(),
        };
        manager.register_collections(vec![collection.clone()]).await;
        Harness {
            api,
            transport,
            thumbnailer,
            observer,
            collection,
            manager,
        }
    }

    async fn harness_with(
        config: UploaderConfig,
        thumbnailer: FakeThumbnailer,
        crypto: Arc<dyn CryptoWorkerFactory>,
    ) -> Harness {
        harness_from(
            config,
            Fakes {
                thumbnailer,
                crypto,
                ..Fakes::default()
            },
        )
        .await
    }

    async fn harness(config: UploaderConfig) -> Harness {
        harness_from(config, Fakes::default()).await
    }

    fn multipart_config() -> UploaderConfig {
        UploaderConfig {
            encryption_chunk_size: 64,
            chunks_per_part: 2,
            multipart_threshold_bytes: 128,
            ..test_config()
        }
    }

    fn image_asset(local_id: LocalId, name: &str) -> UploadAsset {
        UploadAsset::file(local_id, COLLECTION, FileSource::from_bytes(name, png_bytes(8, 8)))
    }

    #[tokio::test]
    async fn test_batch_uploads_every_asset_and_reports_stages() {
        let h = harness(test_config()).await;
        let assets = (1..=3).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let summary = h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();

        assert_eq!(summary.count(FileUploadResult::Uploaded), 3);
        assert_eq!(h.api.registered().len(), 3);
        // thumbnail + body per asset
        assert_eq!(h.transport.object_count(), 6);
        assert_eq!(h.manager.state(), ManagerState::Finish);
        assert_eq!(
            h.observer.stages(),
            vec![UploadStage::Start, UploadStage::Uploading, UploadStage::Finish]
        );
        assert!(h.manager.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn test_registered_envelope_decrypts_with_collection_key() {
        let h = harness(test_config()).await;
        let body = png_bytes(16, 16);
        let asset = UploadAsset::file(1, COLLECTION, FileSource::from_bytes("a.png", body.clone()));

        h.manager.queue_files_for_upload(vec![asset], vec![]).await.unwrap();

        let request = h.api.registered().remove(0);
        assert_eq!(request.collection_id, COLLECTION);
        let file_key = unwrap_key(
            &WrappedKey {
                encrypted_key: request.encrypted_key.clone(),
                key_decryption_nonce: request.key_decryption_nonce.clone(),
            },
            &h.collection.key,
        )
        .unwrap();

        let sealed = h.transport.object(&request.file.object_key).unwrap();
        let plain = ChunkDecryptor::new(&file_key, &request.file.decryption_header)
            .unwrap()
            .open_all(&sealed)
            .unwrap();
        assert_eq!(plain, body);

        let metadata = decrypt_remote_metadata(
            &RemoteFile {
                id: 1,
                collection_id: COLLECTION,
                owner_id: None,
                encrypted_key: request.encrypted_key.clone(),
                key_decryption_nonce: request.key_decryption_nonce.clone(),
                metadata: Some(request.metadata.clone()),
                is_deleted: false,
                updation_time: 0,
            },
            &h.collection,
        )
        .unwrap();
        assert_eq!(metadata.title, "a.png");
        assert_eq!(metadata.file_type, FileType::Image);
    }

    #[tokio::test]
    async fn test_same_file_twice_is_already_uploaded_without_puts() {
        let h = harness(test_config()).await;

        let first = h
            .manager
            .queue_files_for_upload(vec![image_asset(1, "same.png")], vec![])
            .await
            .unwrap();
        assert_eq!(first.result_of(1), Some(FileUploadResult::Uploaded));
        let puts = h.transport.object_count();

        let second = h
            .manager
            .queue_files_for_upload(vec![image_asset(2, "same.png")], vec![])
            .await
            .unwrap();
        assert_eq!(second.result_of(2), Some(FileUploadResult::AlreadyUploaded));
        assert_eq!(h.transport.object_count(), puts);
        assert_eq!(h.api.registered().len(), 1);
    }

    #[tokio::test]
    async fn test_size_ceiling_is_inclusive() {
        let body = png_bytes(8, 8);
        let config = UploaderConfig {
            max_file_size_bytes: body.len() as u64,
            ..test_config()
        };
        let h = harness(config).await;

        let mut bigger = body.clone();
        bigger.push(0);
        let exact = UploadAsset::file(1, COLLECTION, FileSource::from_bytes("exact.png", body));
        let over = UploadAsset::file(2, COLLECTION, FileSource::from_bytes("over.png", bigger));

        let summary = h
            .manager
            .queue_files_for_upload(vec![exact, over], vec![])
            .await
            .unwrap();

        assert_eq!(summary.result_of(1), Some(FileUploadResult::Uploaded));
        assert_eq!(summary.result_of(2), Some(FileUploadResult::TooLarge));
        assert_eq!(h.thumbnailer.calls(), vec!["exact.png".to_string()]);
        assert_eq!(h.transport.object_count(), 2);
        // too large is terminal, never retried
        assert!(h.manager.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_file_is_classified() {
        let h = harness(test_config()).await;
        let asset = UploadAsset::file(1, COLLECTION, FileSource::from_bytes("notes.txt", b"hello".to_vec()));

        let summary = h.manager.queue_files_for_upload(vec![asset], vec![]).await.unwrap();
        assert_eq!(summary.result_of(1), Some(FileUploadResult::Unsupported));
        assert_eq!(summary.results[0].error_code, Some(ErrorCode::UnsupportedFormat));
        assert_eq!(h.transport.object_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_count_bounds_in_flight_assets() {
        let config = UploaderConfig {
            max_concurrent_uploads: 3,
            ..test_config()
        };
        let gauge = Arc::new(InFlightGauge::default());
        let delay = std::time::Duration::from_millis(5);
        let h = harness_from(
            config,
            Fakes {
                thumbnailer: FakeThumbnailer::tracking(delay, gauge.clone()),
                transport: FakeTransport::with_delay(delay),
                observer: RecordingObserver::tracking(gauge.clone()),
                ..Fakes::default()
            },
        )
        .await;
        let assets = (1..=30).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let summary = h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();

        assert_eq!(summary.count(FileUploadResult::Uploaded), 30);
        // thumbnail through encryption, both PUTs and registration
        assert!(gauge.max() <= 3);
        assert!(gauge.max() >= 2);
        assert!(h.thumbnailer.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch_and_is_retried_alone() {
        let h = harness_with(
            test_config(),
            FakeThumbnailer::failing_once("3.png"),
            Arc::new(ThreadCryptoWorkerFactory),
        )
        .await;
        let assets = (1..=5).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let summary = h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();
        for id in [1, 2, 4, 5] {
            assert_eq!(summary.result_of(id), Some(FileUploadResult::Uploaded));
        }
        assert_eq!(summary.result_of(3), Some(FileUploadResult::Failed));
        assert_eq!(h.manager.retry_set().await, vec![3]);

        let calls_before = h.thumbnailer.calls().len();
        let retry = h.manager.retry_failed_files().await.unwrap();
        assert_eq!(retry.results.len(), 1);
        assert_eq!(retry.result_of(3), Some(FileUploadResult::Uploaded));
        assert_eq!(h.thumbnailer.calls()[calls_before..], ["3.png".to_string()]);
        assert_eq!(h.api.registered().len(), 5);
        assert!(h.manager.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_assets() {
        let config = UploaderConfig {
            max_concurrent_uploads: 1,
            ..test_config()
        };
        let thumbnailer = FakeThumbnailer::default();
        let hook = thumbnailer.call_hook();
        let h = harness_with(config, thumbnailer, Arc::new(ThreadCryptoWorkerFactory)).await;
        let manager = h.manager.clone();
        hook.set(2, move || manager.cancel());

        let assets = (1..=5).map(|i| image_asset(i, &format!("{}.png", i))).collect();
        let summary = h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();

        assert_eq!(summary.result_of(1), Some(FileUploadResult::Uploaded));
        // started before the cancel, still classified
        assert_eq!(summary.result_of(2), Some(FileUploadResult::Failed));
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.not_started, vec![3, 4, 5]);
        assert_eq!(h.thumbnailer.calls().len(), 2);
        assert_eq!(h.api.registered().len(), 1);

        let mut retry = h.manager.retry_set().await;
        retry.sort();
        assert_eq!(retry, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_encryption_actor_failure_is_fatal() {
        let h = harness_with(
            test_config(),
            FakeThumbnailer::default(),
            Arc::new(FailingCryptoFactory),
        )
        .await;
        let assets = (1..=3).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let err = h
            .manager
            .queue_files_for_upload(assets, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::EncryptionActorUnavailable(_)));
        assert_eq!(h.transport.object_count(), 0);
        assert_eq!(h.manager.retry_set().await.len(), 3);
    }

    #[tokio::test]
    async fn test_session_expiry_aborts_batch() {
        let config = UploaderConfig {
            max_concurrent_uploads: 1,
            ..test_config()
        };
        let h = harness(config).await;
        h.api.expire_session();
        let assets = (1..=3).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let err = h
            .manager
            .queue_files_for_upload(assets, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionExpired));
        assert_eq!(h.manager.retry_set().await.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_token_refuses_batch() {
        let h = harness(test_config()).await;
        h.api.clear_token();
        let err = h
            .manager
            .queue_files_for_upload(vec![image_asset(1, "a.png")], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NoAuthToken));
        assert_eq!(h.transport.object_count(), 0);
    }

    #[tokio::test]
    async fn test_sidecar_overrides_capture_time() {
        let h = harness(test_config()).await;
        let sidecar = UploadAsset::file(
            10,
            COLLECTION,
            FileSource::from_bytes(
                "1.png.json",
                br#"{"title":"1.png","photoTakenTime":{"timestamp":"1600000000"}}"#.to_vec(),
            ),
        );

        let summary = h
            .manager
            .queue_files_for_upload(vec![image_asset(1, "1.png"), sidecar], vec![])
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 1);
        assert_eq!(
            h.observer.stages(),
            vec![
                UploadStage::Start,
                UploadStage::ReadingSidecarMetadata,
                UploadStage::Uploading,
                UploadStage::Finish
            ]
        );
        let known = h.manager.known_files().snapshot().await;
        assert_eq!(known[0].metadata.creation_time, Some(1_600_000_000_000_000));
    }

    #[tokio::test]
    async fn test_live_photo_is_uploaded_as_one_archive() {
        let h = harness(test_config()).await;
        let image = UploadAsset::file(1, COLLECTION, FileSource::from_bytes("IMG_001.png", png_bytes(8, 8)));
        let video = UploadAsset::file(2, COLLECTION, FileSource::from_bytes("IMG_001.mov", mov_bytes()));

        let summary = h
            .manager
            .queue_files_for_upload(vec![image, video], vec![])
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.result_of(1), Some(FileUploadResult::Uploaded));

        let request = h.api.registered().remove(0);
        let file_key = unwrap_key(
            &WrappedKey {
                encrypted_key: request.encrypted_key,
                key_decryption_nonce: request.key_decryption_nonce,
            },
            &h.collection.key,
        )
        .unwrap();
        let sealed = h.transport.object(&request.file.object_key).unwrap();
        let zipped = ChunkDecryptor::new(&file_key, &request.file.decryption_header)
            .unwrap()
            .open_all(&sealed)
            .unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(zipped)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut video_entry = archive.by_name("IMG_001.mov").unwrap();
        let mut video_data = Vec::new();
        video_entry.read_to_end(&mut video_data).unwrap();
        assert_eq!(video_data, mov_bytes());

        let known = h.manager.known_files().snapshot().await;
        assert_eq!(known[0].metadata.file_type, FileType::LivePhoto);
        assert_eq!(known[0].metadata.title, "IMG_001.png");
    }

    #[tokio::test]
    async fn test_large_file_goes_multipart() {
        let h = harness(multipart_config()).await;
        let body = png_bytes(32, 32);
        assert!(body.len() > 256);
        let asset = UploadAsset::file(1, COLLECTION, FileSource::from_bytes("big.png", body.clone()));

        let summary = h.manager.queue_files_for_upload(vec![asset], vec![]).await.unwrap();
        assert_eq!(summary.result_of(1), Some(FileUploadResult::Uploaded));

        let request = h.api.registered().remove(0);
        let manifests = h.transport.manifests();
        assert_eq!(manifests.len(), 1);
        let chunks = (body.len() as u64).div_ceil(64);
        assert_eq!(
            manifests[0].matches("<Part>").count() as u64,
            chunks.div_ceil(2)
        );

        let sealed = h.transport.object(&request.file.object_key).unwrap();
        let file_key = unwrap_key(
            &WrappedKey {
                encrypted_key: request.encrypted_key,
                key_decryption_nonce: request.key_decryption_nonce,
            },
            &h.collection.key,
        )
        .unwrap();
        let plain = ChunkDecryptor::new(&file_key, &request.file.decryption_header)
            .unwrap()
            .open_all(&sealed)
            .unwrap();
        assert_eq!(plain, body);
    }

    #[tokio::test]
    async fn test_sync_collection_feeds_dedup() {
        let h = harness(test_config()).await;

        // Upload once, then start over with a fresh manager that only knows the remote copy
        h.manager
            .queue_files_for_upload(vec![image_asset(1, "remote.png")], vec![])
            .await
            .unwrap();
        let remote = h.api.remote_files();
        assert_eq!(remote.len(), 1);

        let fresh = harness(test_config()).await;
        fresh.api.set_remote_files(remote);
        let merged = fresh.manager.sync_collection(&h.collection).await.unwrap();
        assert_eq!(merged, 1);

        let summary = fresh
            .manager
            .queue_files_for_upload(vec![image_asset(2, "remote.png")], vec![])
            .await
            .unwrap();
        assert_eq!(summary.result_of(2), Some(FileUploadResult::AlreadyUploaded));
    }

    #[tokio::test]
    async fn test_index_write_failure_still_counts_as_uploaded() {
        let h = harness_from(
            test_config(),
            Fakes {
                index: Arc::new(FailingFileIndex),
                ..Fakes::default()
            },
        )
        .await;

        let summary = h
            .manager
            .queue_files_for_upload(vec![image_asset(1, "a.png")], vec![])
            .await
            .unwrap();
        assert_eq!(summary.result_of(1), Some(FileUploadResult::Uploaded));
        assert!(h.manager.retry_set().await.is_empty());

        // still known for the rest of the run, so never registered twice
        let again = h
            .manager
            .queue_files_for_upload(vec![image_asset(2, "a.png")], vec![])
            .await
            .unwrap();
        assert_eq!(again.result_of(2), Some(FileUploadResult::AlreadyUploaded));
        assert_eq!(h.api.registered().len(), 1);
    }

    #[tokio::test]
    async fn test_single_file_batch_fetches_urls_once() {
        let h = harness(test_config()).await;
        h.manager
            .queue_files_for_upload(vec![image_asset(1, "a.png")], vec![])
            .await
            .unwrap();
        assert_eq!(h.api.url_fetches(), vec![2]);
    }

    #[tokio::test]
    async fn test_leftover_urls_are_not_reused_by_next_batch() {
        let config = UploaderConfig {
            max_concurrent_uploads: 1,
            ..test_config()
        };
        let h = harness(config).await;

        // the duplicate never uses the two slots fetched for it
        let first = h
            .manager
            .queue_files_for_upload(vec![image_asset(1, "a.png"), image_asset(2, "a.png")], vec![])
            .await
            .unwrap();
        assert_eq!(first.result_of(2), Some(FileUploadResult::AlreadyUploaded));
        assert_eq!(h.api.url_fetches(), vec![4]);

        h.manager
            .queue_files_for_upload(vec![image_asset(3, "b.png")], vec![])
            .await
            .unwrap();
        assert_eq!(h.api.url_fetches(), vec![4, 2]);

        let request = h.api.registered().pop().unwrap();
        for leftover in ["obj-2", "obj-3"] {
            assert_ne!(request.file.object_key, leftover);
            assert_ne!(request.thumbnail.object_key, leftover);
        }
    }

    #[tokio::test]
    async fn test_missing_etag_fails_without_retrying_the_part() {
        let config = UploaderConfig {
            retry: kura_core::config::RetryConfig {
                max_attempts: 3,
                backoff_ms: vec![0],
            },
            ..multipart_config()
        };
        let h = harness_from(
            config,
            Fakes {
                transport: FakeTransport::without_etags(),
                ..Fakes::default()
            },
        )
        .await;
        let asset = UploadAsset::file(
            1,
            COLLECTION,
            FileSource::from_bytes("big.png", png_bytes(32, 32)),
        );

        let summary = h.manager.queue_files_for_upload(vec![asset], vec![]).await.unwrap();

        assert_eq!(summary.result_of(1), Some(FileUploadResult::Failed));
        assert_eq!(summary.results[0].error_code, Some(ErrorCode::EtagMissing));
        assert_eq!(h.transport.part_attempts(), 1);
        assert!(h.transport.manifests().is_empty());
        assert!(h.api.registered().is_empty());
        assert_eq!(h.manager.retry_set().await, vec![1]);
    }

    #[tokio::test]
    async fn test_quota_exceeded_blocks_assets_until_retried() {
        let h = harness(test_config()).await;
        h.api.set_quota_exceeded(true);
        let assets = (1..=2).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let summary = h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();
        assert_eq!(summary.count(FileUploadResult::Blocked), 2);
        assert!(summary
            .results
            .iter()
            .all(|r| r.error_code == Some(ErrorCode::SubscriptionOrQuotaExceeded)));
        let mut retry = h.manager.retry_set().await;
        retry.sort();
        assert_eq!(retry, vec![1, 2]);

        h.api.set_quota_exceeded(false);
        let retried = h.manager.retry_failed_files().await.unwrap();
        assert_eq!(retried.count(FileUploadResult::Uploaded), 2);
        assert!(h.manager.retry_set().await.is_empty());
    }

    #[tokio::test]
    async fn test_asset_of_panicked_worker_is_failed() {
        let h = harness_with(
            test_config(),
            FakeThumbnailer::panicking_on("2.png"),
            Arc::new(ThreadCryptoWorkerFactory),
        )
        .await;
        let assets = (1..=3).map(|i| image_asset(i, &format!("{}.png", i))).collect();

        let summary = h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();

        assert_eq!(summary.results.len(), 3);
        assert!(summary.not_started.is_empty());
        assert_eq!(summary.result_of(1), Some(FileUploadResult::Uploaded));
        assert_eq!(summary.result_of(2), Some(FileUploadResult::Failed));
        assert_eq!(summary.result_of(3), Some(FileUploadResult::Uploaded));
        assert_eq!(h.manager.retry_set().await, vec![2]);
    }

    #[tokio::test]
    async fn test_draining_starts_when_queue_is_empty() {
        let config = UploaderConfig {
            max_concurrent_uploads: 1,
            ..test_config()
        };
        let thumbnailer = FakeThumbnailer::default();
        let hook = thumbnailer.call_hook();
        let h = harness_with(config, thumbnailer, Arc::new(ThreadCryptoWorkerFactory)).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        for call in 1..=3 {
            let manager = h.manager.clone();
            let seen = seen.clone();
            hook.set(call, move || seen.lock().unwrap().push(manager.state()));
        }

        let assets = (1..=3).map(|i| image_asset(i, &format!("{}.png", i))).collect();
        h.manager.queue_files_for_upload(assets, vec![]).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ManagerState::Uploading,
                ManagerState::Uploading,
                ManagerState::Draining
            ]
        );
        assert_eq!(h.manager.state(), ManagerState::Finish);
    }
}
