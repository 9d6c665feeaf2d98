//! Encryption actor
//!
//! Every upload worker owns one actor: a dedicated OS thread that holds the cipher state of
//! the stream it is currently sealing. The worker talks to it over a channel and awaits each
//! reply, so CPU-bound sealing never runs on the async runtime.

use bytes::Bytes;
use kura_core::{
    encrypt_blob, wrap_key, ChunkEncryptor, CryptoError, EncryptedBlob, SymmetricKey, UploadError,
    WrappedKey,
};
use tokio::sync::{mpsc, oneshot};

const ACTOR_QUEUE_DEPTH: usize = 8;

type Reply<T> = oneshot::Sender<Result<T, CryptoError>>;

enum CryptoRequest {
    EncryptBlob {
        key: SymmetricKey,
        data: Bytes,
        reply: Reply<EncryptedBlob>,
    },
    EncryptFile {
        key: SymmetricKey,
        data: Bytes,
        chunk_size: usize,
        reply: Reply<(String, Vec<u8>)>,
    },
    StartStream {
        key: SymmetricKey,
        chunk_size: usize,
        reply: Reply<String>,
    },
    SealChunk {
        data: Bytes,
        is_final: bool,
        reply: Reply<Vec<u8>>,
    },
    WrapKey {
        file_key: SymmetricKey,
        collection_key: SymmetricKey,
        reply: Reply<WrappedKey>,
    },
}

/// Handle to one encryption actor
#[derive(Clone)]
pub struct CryptoWorker {
    name: String,
    tx: mpsc::Sender<CryptoRequest>,
}

impl CryptoWorker {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> CryptoRequest,
    ) -> Result<T, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| UploadError::EncryptionActorUnavailable(self.name.clone()))?;
        let result = rx
            .await
            .map_err(|_| UploadError::EncryptionActorUnavailable(self.name.clone()))?;
        Ok(result?)
    }

    /// Seal a small buffer (thumbnail, metadata) as one authenticated blob
    pub async fn encrypt_blob(
        &self,
        key: &SymmetricKey,
        data: Bytes,
    ) -> Result<EncryptedBlob, UploadError> {
        let key = key.clone();
        self.call(|reply| CryptoRequest::EncryptBlob { key, data, reply })
            .await
    }

    /// Seal a whole file as a chunk stream held in one contiguous buffer.
    /// Returns the stream header and the concatenated sealed chunks.
    pub async fn encrypt_file(
        &self,
        key: &SymmetricKey,
        data: Bytes,
        chunk_size: usize,
    ) -> Result<(String, Vec<u8>), UploadError> {
        let key = key.clone();
        self.call(|reply| CryptoRequest::EncryptFile {
            key,
            data,
            chunk_size,
            reply,
        })
        .await
    }

    /// Begin a new chunk stream, replacing any unfinished one. Returns its header.
    pub async fn start_stream(
        &self,
        key: &SymmetricKey,
        chunk_size: usize,
    ) -> Result<String, UploadError> {
        let key = key.clone();
        self.call(|reply| CryptoRequest::StartStream {
            key,
            chunk_size,
            reply,
        })
        .await
    }

    /// Seal the next chunk of the current stream
    pub async fn seal_chunk(&self, data: Bytes, is_final: bool) -> Result<Vec<u8>, UploadError> {
        self.call(|reply| CryptoRequest::SealChunk {
            data,
            is_final,
            reply,
        })
        .await
    }

    pub async fn wrap_key(
        &self,
        file_key: &SymmetricKey,
        collection_key: &SymmetricKey,
    ) -> Result<WrappedKey, UploadError> {
        let file_key = file_key.clone();
        let collection_key = collection_key.clone();
        self.call(|reply| CryptoRequest::WrapKey {
            file_key,
            collection_key,
            reply,
        })
        .await
    }
}

fn seal_file(key: &SymmetricKey, data: &[u8], chunk_size: usize) -> Result<(String, Vec<u8>), CryptoError> {
    let (mut encryptor, header) = ChunkEncryptor::new(key, chunk_size)?;
    let mut sealed = Vec::with_capacity(data.len() + data.len() / chunk_size.max(1) * 16 + 16);
    if data.is_empty() {
        sealed.extend(encryptor.seal_chunk(&[], true)?);
        return Ok((header, sealed));
    }
    let mut chunks = data.chunks(chunk_size).peekable();
    while let Some(chunk) = chunks.next() {
        let is_final = chunks.peek().is_none();
        sealed.extend(encryptor.seal_chunk(chunk, is_final)?);
    }
    Ok((header, sealed))
}

fn run_actor(mut rx: mpsc::Receiver<CryptoRequest>) {
    let mut stream: Option<ChunkEncryptor> = None;

    while let Some(request) = rx.blocking_recv() {
        match request {
            CryptoRequest::EncryptBlob { key, data, reply } => {
                let _ = reply.send(encrypt_blob(&data, &key));
            }
            CryptoRequest::EncryptFile {
                key,
                data,
                chunk_size,
                reply,
            } => {
                let _ = reply.send(seal_file(&key, &data, chunk_size));
            }
            CryptoRequest::StartStream {
                key,
                chunk_size,
                reply,
            } => {
                let result = ChunkEncryptor::new(&key, chunk_size).map(|(encryptor, header)| {
                    stream = Some(encryptor);
                    header
                });
                let _ = reply.send(result);
            }
            CryptoRequest::SealChunk {
                data,
                is_final,
                reply,
            } => {
                let result = match stream.as_mut() {
                    Some(encryptor) => encryptor.seal_chunk(&data, is_final),
                    None => Err(CryptoError::StreamState("no stream started".to_string())),
                };
                if is_final {
                    stream = None;
                }
                let _ = reply.send(result);
            }
            CryptoRequest::WrapKey {
                file_key,
                collection_key,
                reply,
            } => {
                let _ = reply.send(wrap_key(&file_key, &collection_key));
            }
        }
    }
}

/// Creates one actor per upload worker
pub trait CryptoWorkerFactory: Send + Sync {
    fn spawn(&self, name: &str) -> Result<CryptoWorker, UploadError>;
}

/// Spawns each actor on its own named OS thread
#[derive(Debug, Default, Clone)]
pub struct ThreadCryptoWorkerFactory;

impl CryptoWorkerFactory for ThreadCryptoWorkerFactory {
    fn spawn(&self, name: &str) -> Result<CryptoWorker, UploadError> {
        let (tx, rx) = mpsc::channel(ACTOR_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_actor(rx))
            .map_err(|e| UploadError::EncryptionActorUnavailable(format!("{}: {}", name, e)))?;

        tracing::debug!(actor = %name, "Encryption actor started");
        Ok(CryptoWorker {
            name: name.to_string(),
            tx,
        })
    }
}
