//! Data models for the upload pipeline
//!
//! Each sub-module covers one area: what the caller submits (assets), what the pipeline
//! derives (file type, metadata), what travels over the wire (file records, upload URLs)
//! and how each asset ends (upload results).

mod asset;
mod collection;
mod file;
mod file_type;
mod metadata;
mod upload;

pub use asset::*;
pub use collection::*;
pub use file::*;
pub use file_type::*;
pub use metadata::*;
pub use upload::*;
