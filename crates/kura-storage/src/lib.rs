//! Kura Storage Library
//!
//! Bytes-on-the-wire transfer of encrypted objects to pre-signed blob store URLs.
//!
//! - [`Transport`] is the seam: one PUT per object or part, one completion call per multipart
//!   upload. [`HttpTransport`] implements it over reqwest with a stale-transfer watchdog.
//! - [`retry_async`] wraps every call with bounded, cancellable retries.
//! - [`ObjectUploader`] decides nothing about routing; it executes a single PUT or a
//!   multipart upload (chunks batched into parts, ETags collected in order, completion
//!   manifest posted last).

pub mod http;
pub mod multipart;
pub mod retry;
pub mod traits;

// Re-export commonly used types
pub use http::HttpTransport;
pub use multipart::{part_count, CompletedPart, MultipartManifest, ObjectUploader};
pub use retry::{retry_async, RetryPolicy};
pub use traits::{ChunkSource, ProgressFn, Transport, TransportError, TransportResult};
