//! Kura Core Library
//!
//! This crate provides the domain models, error taxonomy, configuration and envelope
//! encryption primitives shared by every kura component.

pub mod config;
pub mod constants;
pub mod encryption;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::{RetryConfig, ThumbnailConfig, UploaderConfig};
pub use encryption::{
    decrypt_blob, encrypt_blob, unwrap_key, wrap_key, ChunkDecryptor, ChunkEncryptor,
    CryptoError, EncryptedBlob, SymmetricKey, WrappedKey,
};
pub use error::{ErrorCode, ErrorMetadata, LogLevel, UploadError};
