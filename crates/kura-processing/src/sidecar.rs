//! Google Takeout style sidecar metadata
//!
//! A sidecar `IMG_0001.jpg.json` describes `IMG_0001.jpg` in the same collection. Takeout clips
//! long names and moves duplicate markers around, so lookups try a few keys in order.

use std::collections::HashMap;

use anyhow::{Context, Result};
use kura_core::constants::SIDECAR_TITLE_MAX_CHARS;
use kura_core::models::{strip_extension, CollectionId, ParsedSidecarMetadata};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TakeoutJson {
    title: Option<String>,
    photo_taken_time: Option<TakeoutTimestamp>,
    creation_time: Option<TakeoutTimestamp>,
    modification_time: Option<TakeoutTimestamp>,
    geo_data: Option<TakeoutGeo>,
    geo_data_exif: Option<TakeoutGeo>,
}

#[derive(Debug, Deserialize)]
struct TakeoutTimestamp {
    timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TakeoutGeo {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl TakeoutTimestamp {
    /// Seconds (string or number) to microseconds
    fn micros(&self) -> Option<i64> {
        let seconds = match self.timestamp.as_ref()? {
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
            serde_json::Value::Number(n) => n.as_i64()?,
            _ => return None,
        };
        seconds.checked_mul(1_000_000)
    }
}

impl TakeoutGeo {
    fn location(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if !(lat == 0.0 && lon == 0.0) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Parse one sidecar file. Returns the media title it describes (if the file names one) and
/// the override values.
pub fn parse_sidecar(data: &[u8]) -> Result<(Option<String>, ParsedSidecarMetadata)> {
    let json: TakeoutJson =
        serde_json::from_slice(data).context("Failed to parse sidecar metadata JSON")?;

    let creation_time = json
        .photo_taken_time
        .as_ref()
        .and_then(TakeoutTimestamp::micros)
        .or_else(|| json.creation_time.as_ref().and_then(TakeoutTimestamp::micros));
    let modification_time = json
        .modification_time
        .as_ref()
        .and_then(TakeoutTimestamp::micros);
    let location = json
        .geo_data
        .as_ref()
        .and_then(TakeoutGeo::location)
        .or_else(|| json.geo_data_exif.as_ref().and_then(TakeoutGeo::location));

    Ok((
        json.title.filter(|t| !t.trim().is_empty()),
        ParsedSidecarMetadata {
            creation_time,
            modification_time,
            latitude: location.map(|(lat, _)| lat),
            longitude: location.map(|(_, lon)| lon),
        },
    ))
}

/// Title a sidecar file describes when its JSON does not say: the file name minus `.json`
pub fn sidecar_title_from_file_name(file_name: &str) -> String {
    strip_extension(file_name).to_string()
}

/// Remove a Takeout duplicate marker: `IMG(1).jpg` and `IMG (1).jpg` become `IMG.jpg`
fn strip_duplicate_marker(name: &str) -> Option<String> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let open = stem.rfind('(')?;
    let inner = stem[open..].strip_prefix('(')?.strip_suffix(')')?;
    if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let base = stem[..open].trim_end();
    if base.is_empty() {
        return None;
    }
    Some(match ext {
        Some(ext) => format!("{}.{}", base, ext),
        None => base.to_string(),
    })
}

fn clip(name: &str) -> String {
    name.chars().take(SIDECAR_TITLE_MAX_CHARS).collect()
}

/// Sidecar overrides keyed by `(collection, title)`
#[derive(Debug, Default, Clone)]
pub struct SidecarMetadataMap {
    entries: HashMap<(CollectionId, String), ParsedSidecarMetadata>,
}

impl SidecarMetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        collection_id: CollectionId,
        title: impl Into<String>,
        metadata: ParsedSidecarMetadata,
    ) {
        self.entries.insert((collection_id, title.into()), metadata);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the sidecar for a media file: exact name, then without a duplicate marker, then
    /// clipped to the Takeout title limit.
    pub fn lookup(
        &self,
        collection_id: CollectionId,
        file_name: &str,
    ) -> Option<&ParsedSidecarMetadata> {
        let mut candidates = vec![file_name.to_string()];
        if let Some(deduped) = strip_duplicate_marker(file_name) {
            candidates.push(clip(&deduped));
            candidates.push(deduped);
        }
        candidates.push(clip(file_name));

        candidates
            .into_iter()
            .find_map(|key| self.entries.get(&(collection_id, key)))
    }
}
