//! Helpers for the `kura-upload` binary

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kura_core::models::{CollectionId, FileSource, FileUploadResult, UploadAsset};
use kura_uploader::BatchSummary;
use walkdir::WalkDir;

/// Initialize tracing for CLI binaries.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kura=info")),
        )
        .with_target(false)
        .init();
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Expand `paths` into regular files. Directories are walked recursively, hidden entries are
/// skipped, and the result is sorted so local ids are stable between runs.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        if meta.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
        {
            let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// One asset per file, numbered from 1
pub fn build_assets(files: Vec<PathBuf>, collection_id: CollectionId) -> Vec<UploadAsset> {
    files
        .into_iter()
        .enumerate()
        .map(|(i, path)| UploadAsset::file(i as u64 + 1, collection_id, FileSource::from_path(path)))
        .collect()
}

/// Human readable one-line-per-result report
pub fn format_summary(summary: &BatchSummary) -> String {
    let mut out = String::new();
    for result in &summary.results {
        let code = result
            .error_code
            .map(|c| format!(" ({})", c))
            .unwrap_or_default();
        out.push_str(&format!(
            "{:>6}  {:<16} {}{}\n",
            result.local_id,
            format!("{:?}", result.result),
            result.title,
            code
        ));
    }
    let counts = [
        FileUploadResult::Uploaded,
        FileUploadResult::AlreadyUploaded,
        FileUploadResult::Unsupported,
        FileUploadResult::TooLarge,
        FileUploadResult::Blocked,
        FileUploadResult::Failed,
    ]
    .iter()
    .map(|r| format!("{:?}={}", r, summary.count(*r)))
    .collect::<Vec<_>>()
    .join(" ");
    out.push_str(&format!(
        "{} not_started={}\n",
        counts,
        summary.not_started.len()
    ));
    out
}
