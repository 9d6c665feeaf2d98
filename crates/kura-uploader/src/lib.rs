//! Kura upload manager
//!
//! Takes a batch of local assets and drives each one through type detection, metadata
//! extraction, dedup, thumbnailing, envelope encryption, blob upload and registration with
//! the metadata service. Up to a configured number of assets are in flight at once.

pub mod crypto_worker;
pub mod dedup;
pub mod encryptor;
pub mod local_index;
pub mod manager;
pub mod observer;
pub mod pipeline;
pub mod url_pool;

#[cfg(test)]
mod test_helpers;

pub use crypto_worker::{CryptoWorker, CryptoWorkerFactory, ThreadCryptoWorkerFactory};
pub use dedup::{is_same_file, KnownFiles};
pub use local_index::{JsonFileIndex, LocalFileIndex, MemoryFileIndex};
pub use manager::{AssetResult, BatchSummary, ManagerState, UploadManager, UploadServices};
pub use observer::{TracingObserver, UploadCounters, UploadObserver};
pub use url_pool::UploadUrlPool;
