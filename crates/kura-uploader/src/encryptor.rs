//! Envelope encryption of one asset
//!
//! A fresh per-file key seals the file body, the thumbnail and the metadata; the key itself
//! leaves this module only wrapped under the collection key. Bodies up to the stream
//! threshold are sealed up front into one buffer. Larger bodies are sealed lazily, chunk by
//! chunk, as the transport pulls them.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::{Bytes, BytesMut};
use kura_core::encryption::TAG_BYTES;
use kura_core::models::{
    CollectionId, ExtractedMetadata, FileAttributes, FileSource, MetadataAttributes,
    UploadFileRequest,
};
use kura_core::{EncryptedBlob, SymmetricKey, UploadError, WrappedKey};
use kura_processing::{read_all, ChunkReader};
use kura_storage::{ChunkSource, TransportError, TransportResult};

use crate::crypto_worker::CryptoWorker;

/// Sealed chunk stream pulled on demand
pub struct EncryptedStream {
    reader: ChunkReader,
    worker: CryptoWorker,
}

impl EncryptedStream {
    pub fn chunk_count(&self) -> u64 {
        self.reader.chunk_count()
    }

    /// Size of the sealed stream in bytes
    pub fn encrypted_size(&self) -> u64 {
        self.reader.total_size() + self.reader.chunk_count() * TAG_BYTES as u64
    }

    /// Seal every remaining chunk into one buffer
    pub async fn collect(mut self) -> Result<Bytes, UploadError> {
        let mut out = BytesMut::with_capacity(self.encrypted_size() as usize);
        while let Some(chunk) = self.next_sealed().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    async fn next_sealed(&mut self) -> Result<Option<Bytes>, UploadError> {
        let Some(plain) = self.reader.next_chunk().await? else {
            return Ok(None);
        };
        let is_final = self.reader.is_exhausted();
        let sealed = self.worker.seal_chunk(plain, is_final).await?;
        Ok(Some(Bytes::from(sealed)))
    }
}

#[async_trait]
impl ChunkSource for EncryptedStream {
    fn chunk_count(&self) -> u64 {
        self.reader.chunk_count()
    }

    async fn next_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        self.next_sealed()
            .await
            .map_err(|e| TransportError::Source(e.to_string()))
    }
}

pub enum EncryptedFileData {
    Buffer(Bytes),
    Stream(EncryptedStream),
}

impl EncryptedFileData {
    pub fn encrypted_size(&self) -> u64 {
        match self {
            EncryptedFileData::Buffer(data) => data.len() as u64,
            EncryptedFileData::Stream(stream) => stream.encrypted_size(),
        }
    }
}

pub struct EncryptedFile {
    pub decryption_header: String,
    pub data: EncryptedFileData,
}

/// Fully encrypted asset, not yet uploaded
pub struct ProcessedFile {
    pub file: EncryptedFile,
    pub thumbnail: EncryptedBlob,
    pub metadata: EncryptedBlob,
    pub wrapped_key: WrappedKey,
}

/// Encrypted asset whose bytes have landed in the blob store
#[derive(Debug, Clone)]
pub struct BackupedFile {
    pub file: FileAttributes,
    pub thumbnail: FileAttributes,
    pub metadata: MetadataAttributes,
    pub wrapped_key: WrappedKey,
}

impl BackupedFile {
    pub fn into_request(self, collection_id: CollectionId) -> UploadFileRequest {
        UploadFileRequest {
            collection_id,
            encrypted_key: self.wrapped_key.encrypted_key,
            key_decryption_nonce: self.wrapped_key.key_decryption_nonce,
            file: self.file,
            thumbnail: self.thumbnail,
            metadata: self.metadata,
        }
    }
}

pub struct EnvelopeEncryptor {
    chunk_size: usize,
    stream_threshold: u64,
}

impl EnvelopeEncryptor {
    pub fn new(chunk_size: usize, stream_threshold: u64) -> Self {
        Self {
            chunk_size,
            stream_threshold,
        }
    }

    /// Encrypt body, thumbnail and metadata under a fresh key and wrap that key under
    /// `collection_key`. Any failure aborts the whole asset.
    pub async fn encrypt(
        &self,
        worker: &CryptoWorker,
        source: &FileSource,
        size: u64,
        thumbnail: &[u8],
        metadata: &ExtractedMetadata,
        collection_key: &SymmetricKey,
    ) -> Result<ProcessedFile, UploadError> {
        let file_key = SymmetricKey::generate();

        let file = if size > self.stream_threshold {
            let reader = ChunkReader::open(source, self.chunk_size).await?;
            let decryption_header = worker.start_stream(&file_key, self.chunk_size).await?;
            EncryptedFile {
                decryption_header,
                data: EncryptedFileData::Stream(EncryptedStream {
                    reader,
                    worker: worker.clone(),
                }),
            }
        } else {
            let data = read_all(source).await?;
            let (decryption_header, sealed) =
                worker.encrypt_file(&file_key, data, self.chunk_size).await?;
            EncryptedFile {
                decryption_header,
                data: EncryptedFileData::Buffer(Bytes::from(sealed)),
            }
        };

        let thumbnail = worker
            .encrypt_blob(&file_key, Bytes::copy_from_slice(thumbnail))
            .await?;
        let metadata_json = serde_json::to_vec(metadata)?;
        let metadata = worker
            .encrypt_blob(&file_key, Bytes::from(metadata_json))
            .await?;
        let wrapped_key = worker.wrap_key(&file_key, collection_key).await?;

        Ok(ProcessedFile {
            file,
            thumbnail,
            metadata,
            wrapped_key,
        })
    }
}

/// Base64 form of an encrypted metadata blob, as carried inline by the registration call
pub fn metadata_attributes(blob: &EncryptedBlob) -> MetadataAttributes {
    MetadataAttributes {
        encrypted_data: general_purpose::STANDARD.encode(&blob.encrypted_data),
        decryption_header: blob.decryption_header.clone(),
    }
}
