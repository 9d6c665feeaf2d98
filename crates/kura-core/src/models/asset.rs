use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::constants::SIDECAR_EXTENSION;

/// Locally unique sequence id used for queue bookkeeping and progress reporting
pub type LocalId = u64;

/// Remote collection identifier
pub type CollectionId = i64;

/// Where an asset's bytes come from
#[derive(Debug, Clone)]
pub enum FileSource {
    /// File on the local filesystem
    Path(PathBuf),
    /// In-memory blob (drag and drop, tests, generated archives)
    Memory {
        name: String,
        data: Bytes,
        /// Last modification time in microseconds since the epoch
        last_modified: Option<i64>,
    },
}

impl FileSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        FileSource::Path(path.into())
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        FileSource::Memory {
            name: name.into(),
            data: data.into(),
            last_modified: None,
        }
    }

    /// File name including extension
    pub fn name(&self) -> String {
        match self {
            FileSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            FileSource::Memory { name, .. } => name.clone(),
        }
    }

    /// Lowercased extension without the dot
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            FileSource::Path(path) => Some(path),
            FileSource::Memory { .. } => None,
        }
    }

    pub fn is_sidecar(&self) -> bool {
        self.extension().as_deref() == Some(SIDECAR_EXTENSION)
    }
}

/// Lowercased extension of a file name, without the dot
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// File name with its last extension removed
pub fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => stem,
        _ => name,
    }
}

/// Image and video halves of one live photo
#[derive(Debug, Clone)]
pub struct LivePhotoAssets {
    pub image: FileSource,
    pub video: FileSource,
}

#[derive(Debug, Clone)]
pub enum AssetPayload {
    File(FileSource),
    LivePhoto(LivePhotoAssets),
}

/// One logical unit of upload work
#[derive(Debug, Clone)]
pub struct UploadAsset {
    pub local_id: LocalId,
    pub collection_id: CollectionId,
    pub payload: AssetPayload,
}

impl UploadAsset {
    pub fn file(local_id: LocalId, collection_id: CollectionId, source: FileSource) -> Self {
        Self {
            local_id,
            collection_id,
            payload: AssetPayload::File(source),
        }
    }

    /// Display title: the file name, or the image name for a live photo
    pub fn title(&self) -> String {
        match &self.payload {
            AssetPayload::File(source) => source.name(),
            AssetPayload::LivePhoto(assets) => assets.image.name(),
        }
    }

    pub fn is_sidecar(&self) -> bool {
        matches!(&self.payload, AssetPayload::File(source) if source.is_sidecar())
    }

    pub fn is_live_photo(&self) -> bool {
        matches!(self.payload, AssetPayload::LivePhoto(_))
    }
}
