//! Envelope encryption primitives (AES-256-GCM)
//!
//! Three shapes are produced here:
//!
//! - **Blobs**: one authenticated buffer. The decryption header is the base64 12-byte nonce.
//! - **Chunk streams**: each chunk is sealed on its own, chained to the previous one. Chunk `i`
//!   uses nonce `base XOR be32(i)` and associated data `previous tag || final flag`, so chunks
//!   only open in their original order and a truncated stream is detected. The decryption
//!   header is `base nonce || be32(plaintext chunk size)`, base64 encoded.
//! - **Wrapped keys**: a per-file key sealed as a blob under the collection key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;
const STREAM_HEADER_BYTES: usize = NONCE_BYTES + 4;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid decryption header: {0}")]
    InvalidHeader(String),

    #[error("Encryption failed")]
    SealFailed,

    #[error("Decryption failed: authentication tag mismatch")]
    OpenFailed,

    #[error("Chunk stream misuse: {0}")]
    StreamState(String),
}

/// 256-bit symmetric key. The bytes never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_BYTES]);

impl SymmetricKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_BYTES];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_BYTES {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_BYTES,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_BYTES];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// A single authenticated ciphertext plus the header needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub encrypted_data: Vec<u8>,
    pub decryption_header: String,
}

/// A per-file key sealed under a collection key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub encrypted_key: String,
    pub key_decryption_nonce: String,
}

/// Encrypt a buffer as one authenticated blob.
pub fn encrypt_blob(data: &[u8], key: &SymmetricKey) -> Result<EncryptedBlob, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, data)
        .map_err(|_| CryptoError::SealFailed)?;

    Ok(EncryptedBlob {
        encrypted_data: ciphertext,
        decryption_header: general_purpose::STANDARD.encode(nonce),
    })
}

/// Decrypt a blob produced by [`encrypt_blob`].
pub fn decrypt_blob(
    ciphertext: &[u8],
    decryption_header: &str,
    key: &SymmetricKey,
) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = decode_header(decryption_header)?;
    if nonce_bytes.len() != NONCE_BYTES {
        return Err(CryptoError::InvalidHeader(format!(
            "blob header must be {} bytes, got {}",
            NONCE_BYTES,
            nonce_bytes.len()
        )));
    }

    key.cipher()
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Seal `file_key` under `collection_key`.
pub fn wrap_key(
    file_key: &SymmetricKey,
    collection_key: &SymmetricKey,
) -> Result<WrappedKey, CryptoError> {
    let blob = encrypt_blob(file_key.as_bytes(), collection_key)?;
    Ok(WrappedKey {
        encrypted_key: general_purpose::STANDARD.encode(&blob.encrypted_data),
        key_decryption_nonce: blob.decryption_header,
    })
}

/// Recover a per-file key sealed with [`wrap_key`].
pub fn unwrap_key(
    wrapped: &WrappedKey,
    collection_key: &SymmetricKey,
) -> Result<SymmetricKey, CryptoError> {
    let ciphertext = general_purpose::STANDARD
        .decode(&wrapped.encrypted_key)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {}", e)))?;
    let bytes = decrypt_blob(&ciphertext, &wrapped.key_decryption_nonce, collection_key)?;
    SymmetricKey::from_bytes(&bytes)
}

fn decode_header(header: &str) -> Result<Vec<u8>, CryptoError> {
    general_purpose::STANDARD
        .decode(header)
        .map_err(|e| CryptoError::InvalidHeader(format!("invalid base64: {}", e)))
}

fn chunk_nonce(base: &[u8; NONCE_BYTES], index: u32) -> [u8; NONCE_BYTES] {
    let mut nonce = *base;
    for (slot, b) in nonce[NONCE_BYTES - 4..]
        .iter_mut()
        .zip(index.to_be_bytes().iter())
    {
        *slot ^= b;
    }
    nonce
}

fn chunk_aad(chain: &[u8; TAG_BYTES], is_final: bool) -> [u8; TAG_BYTES + 1] {
    let mut aad = [0u8; TAG_BYTES + 1];
    aad[..TAG_BYTES].copy_from_slice(chain);
    aad[TAG_BYTES] = u8::from(is_final);
    aad
}

fn last_tag(ciphertext: &[u8]) -> [u8; TAG_BYTES] {
    let mut tag = [0u8; TAG_BYTES];
    tag.copy_from_slice(&ciphertext[ciphertext.len() - TAG_BYTES..]);
    tag
}

/// Shared cursor state of a chunk stream.
struct ChainState {
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_BYTES],
    index: u32,
    chain: [u8; TAG_BYTES],
    finished: bool,
}

impl ChainState {
    fn advance(&mut self, ciphertext: &[u8], is_final: bool) -> Result<(), CryptoError> {
        self.chain = last_tag(ciphertext);
        self.finished = is_final;
        self.index = self
            .index
            .checked_add(1)
            .ok_or_else(|| CryptoError::StreamState("chunk counter overflow".to_string()))?;
        Ok(())
    }
}

/// Sealing side of a chained chunk stream.
pub struct ChunkEncryptor {
    state: ChainState,
    chunk_size: u32,
}

impl ChunkEncryptor {
    /// Start a new stream. Returns the encryptor and its base64 decryption header.
    pub fn new(key: &SymmetricKey, chunk_size: usize) -> Result<(Self, String), CryptoError> {
        let chunk_size = u32::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                CryptoError::StreamState(format!("invalid chunk size {}", chunk_size))
            })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut base_nonce = [0u8; NONCE_BYTES];
        base_nonce.copy_from_slice(nonce.as_slice());

        let mut header = Vec::with_capacity(STREAM_HEADER_BYTES);
        header.extend_from_slice(&base_nonce);
        header.extend_from_slice(&chunk_size.to_be_bytes());

        Ok((
            Self {
                state: ChainState {
                    cipher: key.cipher(),
                    base_nonce,
                    index: 0,
                    chain: [0u8; TAG_BYTES],
                    finished: false,
                },
                chunk_size,
            },
            general_purpose::STANDARD.encode(header),
        ))
    }

    /// Seal the next chunk. Every chunk except the final one must be exactly `chunk_size` bytes.
    pub fn seal_chunk(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>, CryptoError> {
        if self.state.finished {
            return Err(CryptoError::StreamState(
                "stream already finalized".to_string(),
            ));
        }
        if !is_final && plaintext.len() != self.chunk_size as usize {
            return Err(CryptoError::StreamState(format!(
                "non-final chunk of {} bytes, expected {}",
                plaintext.len(),
                self.chunk_size
            )));
        }
        if plaintext.len() > self.chunk_size as usize {
            return Err(CryptoError::StreamState(format!(
                "chunk of {} bytes exceeds chunk size {}",
                plaintext.len(),
                self.chunk_size
            )));
        }

        let nonce = chunk_nonce(&self.state.base_nonce, self.state.index);
        let aad = chunk_aad(&self.state.chain, is_final);
        let ciphertext = self
            .state
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;

        self.state.advance(&ciphertext, is_final)?;
        Ok(ciphertext)
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }
}

/// Opening side of a chained chunk stream.
pub struct ChunkDecryptor {
    state: ChainState,
    chunk_size: u32,
}

impl ChunkDecryptor {
    pub fn new(key: &SymmetricKey, decryption_header: &str) -> Result<Self, CryptoError> {
        let header = decode_header(decryption_header)?;
        if header.len() != STREAM_HEADER_BYTES {
            return Err(CryptoError::InvalidHeader(format!(
                "stream header must be {} bytes, got {}",
                STREAM_HEADER_BYTES,
                header.len()
            )));
        }

        let mut base_nonce = [0u8; NONCE_BYTES];
        base_nonce.copy_from_slice(&header[..NONCE_BYTES]);
        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&header[NONCE_BYTES..]);

        Ok(Self {
            state: ChainState {
                cipher: key.cipher(),
                base_nonce,
                index: 0,
                chain: [0u8; TAG_BYTES],
                finished: false,
            },
            chunk_size: u32::from_be_bytes(size_bytes),
        })
    }

    /// Size of one sealed chunk on the wire.
    pub fn encrypted_chunk_size(&self) -> usize {
        self.chunk_size as usize + TAG_BYTES
    }

    pub fn open_chunk(&mut self, ciphertext: &[u8], is_final: bool) -> Result<Vec<u8>, CryptoError> {
        if self.state.finished {
            return Err(CryptoError::StreamState(
                "stream already finalized".to_string(),
            ));
        }
        if ciphertext.len() < TAG_BYTES {
            return Err(CryptoError::OpenFailed);
        }

        let nonce = chunk_nonce(&self.state.base_nonce, self.state.index);
        let aad = chunk_aad(&self.state.chain, is_final);
        let plaintext = self
            .state
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::OpenFailed)?;

        self.state.advance(ciphertext, is_final)?;
        Ok(plaintext)
    }

    /// Decrypt a whole concatenated chunk stream in one call.
    pub fn open_all(mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let step = self.encrypted_chunk_size();
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        let mut chunks = ciphertext.chunks(step).peekable();
        if chunks.peek().is_none() {
            return Err(CryptoError::OpenFailed);
        }
        while let Some(chunk) = chunks.next() {
            let is_final = chunks.peek().is_none();
            plaintext.extend(self.open_chunk(chunk, is_final)?);
        }
        Ok(plaintext)
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }
}
