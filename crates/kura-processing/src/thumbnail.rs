//! Thumbnail generation
//!
//! Thumbnails are JPEGs whose long edge is capped at `max_dimension`. Encoding starts at
//! `initial_quality` and steps down until the output fits `max_size_bytes` or the quality
//! floor is reached. Anything that goes wrong (undecodable input, missing ffmpeg, timeout)
//! yields the built-in placeholder with `has_static_thumbnail` set.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use kura_core::config::ThumbnailConfig;
use kura_core::models::{FileSource, FileType, FileTypeInfo};
use tokio::process::Command;

use crate::reader::read_all;

const PLACEHOLDER_DIMENSION: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub data: Vec<u8>,
    pub has_static_thumbnail: bool,
}

impl Thumbnail {
    pub fn placeholder() -> Self {
        Self {
            data: placeholder_jpeg().to_vec(),
            has_static_thumbnail: true,
        }
    }
}

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Produce a thumbnail for `source`. Implementations fall back to a placeholder for
    /// undecodable media; an `Err` means the asset itself cannot be processed.
    async fn generate(&self, source: &FileSource, type_info: &FileTypeInfo) -> Result<Thumbnail>;
}

/// Decodes images with the `image` crate and grabs video frames with ffmpeg
pub struct MediaThumbnailGenerator {
    config: ThumbnailConfig,
    ffmpeg_path: String,
}

impl MediaThumbnailGenerator {
    pub fn new(config: ThumbnailConfig, ffmpeg_path: impl Into<String>) -> Self {
        Self {
            config,
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    async fn try_generate(&self, source: &FileSource, type_info: &FileTypeInfo) -> Result<Vec<u8>> {
        let frame = match type_info.file_type {
            FileType::Image | FileType::LivePhoto => read_all(source).await?.to_vec(),
            FileType::Video => self.extract_video_frame(source).await?,
            FileType::Other => return Err(anyhow!("no thumbnail for unsupported file type")),
        };

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || encode_thumbnail(&frame, &config))
            .await
            .context("Thumbnail task panicked")?
    }

    async fn extract_video_frame(&self, source: &FileSource) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir().context("Failed to create temp dir")?;
        let input: PathBuf = match source {
            FileSource::Path(path) => path.clone(),
            FileSource::Memory { data, .. } => {
                let path = workdir.path().join("input");
                tokio::fs::write(&path, data).await?;
                path
            }
        };
        let output_path = workdir.path().join("frame.jpg");

        // First frame after one second, then the very first frame for short clips
        for timestamp in ["1", "0"] {
            self.run_ffmpeg_frame(&input, &output_path, timestamp).await?;
            if let Ok(frame) = tokio::fs::read(&output_path).await {
                if !frame.is_empty() {
                    return Ok(frame);
                }
            }
        }
        Err(anyhow!("ffmpeg produced no frame"))
    }

    async fn run_ffmpeg_frame(&self, input: &Path, output: &Path, timestamp: &str) -> Result<()> {
        let args = vec![
            "-ss".to_string(),
            timestamp.to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vframes".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ];

        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("FFmpeg thumbnail extraction failed: {}", stderr));
        }
        Ok(())
    }
}

#[async_trait]
impl ThumbnailGenerator for MediaThumbnailGenerator {
    async fn generate(&self, source: &FileSource, type_info: &FileTypeInfo) -> Result<Thumbnail> {
        let start = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeout(),
            self.try_generate(source, type_info),
        )
        .await;

        match outcome {
            Ok(Ok(data)) => {
                tracing::debug!(
                    size_bytes = data.len(),
                    duration_ms = start.elapsed().as_millis(),
                    "Thumbnail generated"
                );
                Ok(Thumbnail {
                    data,
                    has_static_thumbnail: false,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    file_name = %source.name(),
                    error = %e,
                    "Thumbnail generation failed, using placeholder"
                );
                Ok(Thumbnail::placeholder())
            }
            Err(_) => {
                tracing::warn!(
                    file_name = %source.name(),
                    timeout_secs = self.config.timeout_secs,
                    "Thumbnail generation timed out, using placeholder"
                );
                Ok(Thumbnail::placeholder())
            }
        }
    }
}

/// Decode, downscale and JPEG-encode within the configured size budget
pub fn encode_thumbnail(data: &[u8], config: &ThumbnailConfig) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data).context("Failed to decode image")?;
    let img = if img.width() > config.max_dimension || img.height() > config.max_dimension {
        img.thumbnail(config.max_dimension, config.max_dimension)
    } else {
        img
    };
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut quality = config.initial_quality.clamp(1, 100);
    loop {
        let encoded = encode_jpeg(&rgb, quality)?;
        let at_floor = quality <= config.min_quality || config.quality_step == 0;
        if encoded.len() <= config.max_size_bytes || at_floor {
            return Ok(encoded);
        }
        quality = quality
            .saturating_sub(config.quality_step)
            .max(config.min_quality)
            .max(1);
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality);
    img.write_with_encoder(encoder)
        .context("Failed to encode JPEG thumbnail")?;
    Ok(buffer)
}

/// Built-in grey placeholder, encoded once per process
pub fn placeholder_jpeg() -> &'static [u8] {
    static PLACEHOLDER: OnceLock<Vec<u8>> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        let img = RgbImage::from_pixel(
            PLACEHOLDER_DIMENSION,
            PLACEHOLDER_DIMENSION,
            Rgb([200, 200, 200]),
        );
        encode_jpeg(&DynamicImage::ImageRgb8(img), 70).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode placeholder thumbnail");
            Vec::new()
        })
    })
}
