use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    Image,
    Video,
    LivePhoto,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::LivePhoto => "livePhoto",
            FileType::Other => "other",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of sniffing an asset's leading bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTypeInfo {
    pub file_type: FileType,
    /// Short format name, usually the canonical extension (`jpeg`, `heic`, `mov`)
    pub exact_type: String,
    pub mime_type: Option<String>,
}

impl FileTypeInfo {
    pub fn new(file_type: FileType, exact_type: impl Into<String>, mime_type: Option<&str>) -> Self {
        Self {
            file_type,
            exact_type: exact_type.into(),
            mime_type: mime_type.map(str::to_string),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.file_type != FileType::Other
    }
}
