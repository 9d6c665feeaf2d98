use serde::{Deserialize, Serialize};

use super::FileType;

/// Metadata recorded for every uploaded file. Times are microseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMetadata {
    pub title: String,
    pub creation_time: Option<i64>,
    pub modification_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_static_thumbnail: Option<bool>,
}

impl ExtractedMetadata {
    pub fn new(title: impl Into<String>, file_type: FileType) -> Self {
        Self {
            title: title.into(),
            creation_time: None,
            modification_time: None,
            latitude: None,
            longitude: None,
            file_type,
            has_static_thumbnail: None,
        }
    }

    /// Merge sidecar values. Only fields the sidecar actually carries are overridden.
    pub fn apply_sidecar(&mut self, sidecar: &ParsedSidecarMetadata) {
        if let Some(t) = sidecar.creation_time {
            self.creation_time = Some(t);
        }
        if let Some(t) = sidecar.modification_time {
            self.modification_time = Some(t);
        }
        if let (Some(lat), Some(lon)) = (sidecar.latitude, sidecar.longitude) {
            self.latitude = Some(lat);
            self.longitude = Some(lon);
        }
    }
}

/// Values read from one sidecar JSON file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSidecarMetadata {
    pub creation_time: Option<i64>,
    pub modification_time: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}
