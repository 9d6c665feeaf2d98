//! Per-asset upload pipeline
//!
//! size check -> type -> metadata (+ sidecar) -> dedup -> thumbnail -> encrypt ->
//! upload thumbnail and body -> register -> index.
//!
//! Every step returns `UploadError`; the manager maps it to a `FileUploadResult`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use kura_api_client::RemoteApi;
use kura_core::config::UploaderConfig;
use kura_core::models::{
    AssetPayload, Collection, CollectionId, ExtractedMetadata, FileAttributes, FileSource,
    FileType, FileTypeInfo, FileUploadResult, IndexedFile, LivePhotoAssets, UploadAsset,
};
use kura_core::UploadError;
use kura_processing::{
    file_size, get_file_type, package_live_photo, read_all, MetadataExtractor,
    SidecarMetadataMap, ThumbnailGenerator,
};
use kura_storage::{part_count, ObjectUploader, ProgressFn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::crypto_worker::CryptoWorker;
use crate::dedup::KnownFiles;
use crate::encryptor::{
    metadata_attributes, BackupedFile, EncryptedFileData, EnvelopeEncryptor, ProcessedFile,
};
use crate::observer::UploadObserver;
use crate::url_pool::UploadUrlPool;

/// Collaborators shared by every worker of a manager
pub struct PipelineContext {
    pub config: UploaderConfig,
    pub api: Arc<dyn RemoteApi>,
    pub url_pool: Arc<UploadUrlPool>,
    pub uploader: ObjectUploader,
    pub thumbnailer: Arc<dyn ThumbnailGenerator>,
    pub extractor: MetadataExtractor,
    pub encryptor: EnvelopeEncryptor,
    pub known_files: Arc<KnownFiles>,
    pub sidecars: Arc<RwLock<SidecarMetadataMap>>,
    pub collections: Arc<RwLock<HashMap<CollectionId, Collection>>>,
    pub observer: Arc<dyn UploadObserver>,
}

/// What the pipeline decided about an asset before encrypting it
struct PreparedAsset {
    source: FileSource,
    size: u64,
    type_info: FileTypeInfo,
    metadata: ExtractedMetadata,
    /// Image half of a live photo, or the file itself
    thumbnail_source: FileSource,
    thumbnail_type: FileTypeInfo,
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), UploadError> {
    if cancel.is_cancelled() {
        return Err(UploadError::Cancelled);
    }
    Ok(())
}

impl PipelineContext {
    /// Drive one asset to a terminal result. `Err` means the asset failed; the error says
    /// how to classify it.
    #[tracing::instrument(
        skip_all,
        fields(local_id = asset.local_id, collection_id = asset.collection_id)
    )]
    pub async fn upload_asset(
        &self,
        asset: &UploadAsset,
        worker: &CryptoWorker,
        cancel: &CancellationToken,
    ) -> Result<FileUploadResult, UploadError> {
        let start = Instant::now();

        let size = asset_size(asset).await?;
        if size > self.config.max_file_size_bytes {
            return Err(UploadError::TooLarge {
                size,
                max: self.config.max_file_size_bytes,
            });
        }

        let collection = self
            .collections
            .read()
            .await
            .get(&asset.collection_id)
            .cloned()
            .ok_or_else(|| {
                UploadError::InvalidInput(format!("unknown collection {}", asset.collection_id))
            })?;

        let prepared = self.prepare(asset, size).await?;

        if let Some(existing) = self
            .known_files
            .find_duplicate(asset.collection_id, &prepared.metadata)
            .await
        {
            tracing::debug!(file_id = existing.id, "Already uploaded, skipping");
            return Ok(FileUploadResult::AlreadyUploaded);
        }

        ensure_not_cancelled(cancel)?;

        let thumbnail = self
            .thumbnailer
            .generate(&prepared.thumbnail_source, &prepared.thumbnail_type)
            .await
            .map_err(|e| UploadError::Thumbnail(e.to_string()))?;
        let mut metadata = prepared.metadata;
        if thumbnail.has_static_thumbnail {
            metadata.has_static_thumbnail = Some(true);
        }

        let processed = self
            .encryptor
            .encrypt(
                worker,
                &prepared.source,
                prepared.size,
                &thumbnail.data,
                &metadata,
                &collection.key,
            )
            .await?;

        let backuped = self.upload_processed(asset, processed, cancel).await?;

        ensure_not_cancelled(cancel)?;

        let request = backuped.into_request(asset.collection_id);
        let remote = self.api.register_file(&request).await?;

        // registered: from here on the asset counts as uploaded whatever the local index does
        if let Err(e) = self
            .known_files
            .insert(IndexedFile {
                id: remote.id,
                collection_id: asset.collection_id,
                metadata,
                updation_time: remote.updation_time,
            })
            .await
        {
            tracing::warn!(
                file_id = remote.id,
                error = %e,
                "Failed to persist local file index"
            );
        }

        tracing::info!(
            file_id = remote.id,
            file_type = %prepared.type_info.file_type,
            size_bytes = prepared.size,
            duration_ms = start.elapsed().as_millis(),
            "File uploaded"
        );
        Ok(FileUploadResult::Uploaded)
    }

    async fn prepare(&self, asset: &UploadAsset, size: u64) -> Result<PreparedAsset, UploadError> {
        let title = asset.title();
        match &asset.payload {
            AssetPayload::File(source) => {
                let type_info = get_file_type(source).await?;
                if !type_info.is_supported() {
                    return Err(UploadError::UnsupportedFormat(type_info.exact_type));
                }
                let metadata = self.extract_metadata(asset, source, &type_info, &title).await;
                Ok(PreparedAsset {
                    source: source.clone(),
                    size,
                    type_info: type_info.clone(),
                    metadata,
                    thumbnail_source: source.clone(),
                    thumbnail_type: type_info,
                })
            }
            AssetPayload::LivePhoto(LivePhotoAssets { image, video }) => {
                let image_type = get_file_type(image).await?;
                let video_type = get_file_type(video).await?;
                if image_type.file_type != FileType::Image || video_type.file_type != FileType::Video
                {
                    return Err(UploadError::UnsupportedFormat(format!(
                        "live photo of {} and {}",
                        image_type.exact_type, video_type.exact_type
                    )));
                }

                let mut metadata = self.extract_metadata(asset, image, &image_type, &title).await;
                metadata.file_type = FileType::LivePhoto;

                let image_data = read_all(image).await?;
                let video_data = read_all(video).await?;
                let zipped = package_live_photo(&image.name(), &image_data, &video.name(), &video_data)?;
                let packaged = FileSource::from_bytes(format!("{}.zip", title), zipped);

                Ok(PreparedAsset {
                    size: file_size(&packaged).await?,
                    source: packaged,
                    type_info: FileTypeInfo::new(FileType::LivePhoto, "zip", Some("application/zip")),
                    metadata,
                    thumbnail_source: image.clone(),
                    thumbnail_type: image_type,
                })
            }
        }
    }

    async fn extract_metadata(
        &self,
        asset: &UploadAsset,
        source: &FileSource,
        type_info: &FileTypeInfo,
        title: &str,
    ) -> ExtractedMetadata {
        let mut metadata = self.extractor.extract(source, type_info, title).await;
        if let Some(sidecar) = self.sidecars.read().await.lookup(asset.collection_id, title) {
            tracing::debug!("Applying sidecar metadata");
            metadata.apply_sidecar(sidecar);
        }
        metadata
    }

    fn progress_reporter(&self, asset: &UploadAsset, total: u64) -> ProgressFn {
        let observer = self.observer.clone();
        let local_id = asset.local_id;
        let last = Arc::new(AtomicU8::new(0));
        Arc::new(move |sent: u64| {
            let percent = if total == 0 {
                100
            } else {
                (sent.saturating_mul(100) / total).min(100) as u8
            };
            if last.swap(percent, Ordering::Relaxed) != percent {
                observer.on_file_progress(local_id, percent);
            }
        })
    }

    async fn upload_processed(
        &self,
        asset: &UploadAsset,
        processed: ProcessedFile,
        cancel: &CancellationToken,
    ) -> Result<BackupedFile, UploadError> {
        let ProcessedFile {
            file,
            thumbnail,
            metadata,
            wrapped_key,
        } = processed;

        let thumbnail_size = thumbnail.encrypted_data.len() as u64;
        let thumbnail_slot = self.url_pool.acquire().await?;
        let thumbnail_key = self
            .uploader
            .put_single(
                &thumbnail_slot,
                Bytes::from(thumbnail.encrypted_data),
                cancel,
                None,
            )
            .await?;

        let file_size = file.data.encrypted_size();
        let progress = self.progress_reporter(asset, file_size);

        let file_key = match file.data {
            EncryptedFileData::Buffer(data) => {
                let slot = self.url_pool.acquire().await?;
                self.uploader
                    .put_single(&slot, data, cancel, Some(progress))
                    .await?
            }
            EncryptedFileData::Stream(mut stream) => {
                let parts = part_count(stream.chunk_count(), self.uploader.chunks_per_part());
                if parts >= 2 {
                    let slot = self.url_pool.acquire_multipart(parts).await?;
                    self.uploader
                        .put_multipart(&slot, &mut stream, cancel, Some(progress))
                        .await?
                } else {
                    let data = stream.collect().await?;
                    let slot = self.url_pool.acquire().await?;
                    self.uploader
                        .put_single(&slot, data, cancel, Some(progress))
                        .await?
                }
            }
        };

        Ok(BackupedFile {
            file: FileAttributes {
                object_key: file_key,
                decryption_header: file.decryption_header,
                size: Some(file_size),
            },
            thumbnail: FileAttributes {
                object_key: thumbnail_key,
                decryption_header: thumbnail.decryption_header,
                size: Some(thumbnail_size),
            },
            metadata: metadata_attributes(&metadata),
            wrapped_key,
        })
    }
}

/// Bytes on disk; both halves for a live photo
pub async fn asset_size(asset: &UploadAsset) -> Result<u64, UploadError> {
    Ok(match &asset.payload {
        AssetPayload::File(source) => file_size(source).await?,
        AssetPayload::LivePhoto(LivePhotoAssets { image, video }) => {
            file_size(image).await? + file_size(video).await?
        }
    })
}
