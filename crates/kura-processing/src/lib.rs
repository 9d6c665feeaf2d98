//! Kura media processing
//!
//! Everything the pipeline learns about an asset before encrypting it: what it is
//! (type sniffing), when and where it was taken (EXIF, container tags, sidecar JSON), what it
//! looks like (thumbnails), and which assets belong together (live photos).

pub mod file_type;
pub mod live_photo;
pub mod metadata;
pub mod reader;
pub mod sidecar;
pub mod thumbnail;

pub use file_type::{detect_file_type, get_file_type};
pub use live_photo::{cluster_live_photos, package_live_photo, ClusterCandidate};
pub use metadata::MetadataExtractor;
pub use reader::{file_size, last_modified, read_all, read_prefix, ChunkReader};
pub use sidecar::{parse_sidecar, SidecarMetadataMap};
pub use thumbnail::{MediaThumbnailGenerator, Thumbnail, ThumbnailGenerator};
