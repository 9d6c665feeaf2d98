//! Storage for the known-files index

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kura_core::models::IndexedFile;
use tokio::sync::Mutex;

#[async_trait]
pub trait LocalFileIndex: Send + Sync {
    async fn load(&self) -> Result<Vec<IndexedFile>>;

    /// Replace the stored index with `files`
    async fn persist(&self, files: &[IndexedFile]) -> Result<()>;
}

/// Process-local index, lost on exit
#[derive(Default)]
pub struct MemoryFileIndex {
    files: Mutex<Vec<IndexedFile>>,
}

impl MemoryFileIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalFileIndex for MemoryFileIndex {
    async fn load(&self) -> Result<Vec<IndexedFile>> {
        Ok(self.files.lock().await.clone())
    }

    async fn persist(&self, files: &[IndexedFile]) -> Result<()> {
        *self.files.lock().await = files.to_vec();
        Ok(())
    }
}

/// Index kept in a JSON file. Writes go to a sibling temp file which is then renamed over
/// the target, so a crash never leaves a half-written index behind.
pub struct JsonFileIndex {
    path: PathBuf,
}

impl JsonFileIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl LocalFileIndex for JsonFileIndex {
    async fn load(&self) -> Result<Vec<IndexedFile>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse index {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read index {}", self.path.display())),
        }
    }

    async fn persist(&self, files: &[IndexedFile]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_vec(files).context("Failed to serialize index")?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, data)
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
