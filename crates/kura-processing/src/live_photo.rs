//! Live-photo clustering and packaging

use std::io::Write;

use anyhow::{Context, Result};
use kura_core::models::{
    extension_of, strip_extension, AssetPayload, FileSource, FileType, LivePhotoAssets,
    UploadAsset,
};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

/// An asset together with what clustering needs to know about it
#[derive(Debug, Clone)]
pub struct ClusterCandidate {
    pub asset: UploadAsset,
    pub file_type: FileType,
    pub size: u64,
}

/// Lowercased stem with platform suffixes removed (`IMG_1_3.mov`, `IMG_1_HEVC.mov`)
fn normalized_base_name(name: &str, file_type: FileType) -> String {
    let mut base = strip_extension(name).to_ascii_lowercase();
    if let Some(stripped) = base.strip_suffix("_hevc") {
        base = stripped.to_string();
    }
    if file_type == FileType::Video {
        if let Some(stripped) = base.strip_suffix("_3") {
            base = stripped.to_string();
        }
    }
    base
}

fn single_source(asset: &UploadAsset) -> Option<&FileSource> {
    match &asset.payload {
        AssetPayload::File(source) => Some(source),
        AssetPayload::LivePhoto(_) => None,
    }
}

fn sort_key(candidate: &ClusterCandidate) -> (String, i64) {
    let name = single_source(&candidate.asset)
        .map(|s| normalized_base_name(&s.name(), candidate.file_type))
        .unwrap_or_default();
    (name, candidate.asset.collection_id)
}

fn try_pair(a: &ClusterCandidate, b: &ClusterCandidate, size_limit: u64) -> Option<UploadAsset> {
    if a.asset.collection_id != b.asset.collection_id {
        return None;
    }
    let (image, video) = match (a.file_type, b.file_type) {
        (FileType::Image, FileType::Video) => (a, b),
        (FileType::Video, FileType::Image) => (b, a),
        _ => return None,
    };
    let image_source = single_source(&image.asset)?;
    let video_source = single_source(&video.asset)?;

    if normalized_base_name(&image_source.name(), FileType::Image)
        != normalized_base_name(&video_source.name(), FileType::Video)
    {
        return None;
    }

    if image.size > size_limit || video.size > size_limit {
        tracing::warn!(
            image = %image_source.name(),
            video = %video_source.name(),
            image_size = image.size,
            video_size = video.size,
            size_limit = size_limit,
            "Live photo candidate exceeds size limit, uploading parts separately"
        );
        return None;
    }

    Some(UploadAsset {
        local_id: image.asset.local_id,
        collection_id: image.asset.collection_id,
        payload: AssetPayload::LivePhoto(LivePhotoAssets {
            image: image_source.clone(),
            video: video_source.clone(),
        }),
    })
}

/// Pair image and video assets that form one live photo.
///
/// Candidates are sorted by normalized name and collection, then adjacent pairs are checked
/// once. Everything that does not pair passes through unchanged. Output is ordered by
/// `local_id`.
pub fn cluster_live_photos(
    mut candidates: Vec<ClusterCandidate>,
    size_limit: u64,
) -> Vec<UploadAsset> {
    candidates.sort_by_cached_key(sort_key);

    let mut out = Vec::with_capacity(candidates.len());
    let mut clustered = 0usize;
    let mut i = 0;
    while i < candidates.len() {
        if let Some(next) = candidates.get(i + 1) {
            if let Some(pair) = try_pair(&candidates[i], next, size_limit) {
                out.push(pair);
                clustered += 1;
                i += 2;
                continue;
            }
        }
        out.push(candidates[i].asset.clone());
        i += 1;
    }

    if clustered > 0 {
        tracing::info!(live_photos = clustered, "Clustered live photos");
    }
    out.sort_by_key(|a| a.local_id);
    out
}

/// Package both halves of a live photo into one uncompressed ZIP. Entries are named
/// `<image stem>.<ext>` so the pair stays recognisable after download.
pub fn package_live_photo(
    image_name: &str,
    image_data: &[u8],
    video_name: &str,
    video_data: &[u8],
) -> Result<Vec<u8>> {
    let stem = strip_extension(image_name);
    let image_entry = format!(
        "{}.{}",
        stem,
        extension_of(image_name).unwrap_or_else(|| "jpg".to_string())
    );
    let video_entry = format!(
        "{}.{}",
        stem,
        extension_of(video_name).unwrap_or_else(|| "mov".to_string())
    );

    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(std::io::Cursor::new(&mut buffer));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(0o644);

        for (entry, data) in [(&image_entry, image_data), (&video_entry, video_data)] {
            zip.start_file(entry.as_str(), options)
                .with_context(|| format!("Failed to add file to ZIP: {}", entry))?;
            zip.write_all(data)
                .with_context(|| format!("Failed to write file data to ZIP: {}", entry))?;
        }

        zip.finish().context("Failed to finalize ZIP archive")?;
    }

    Ok(buffer)
}
