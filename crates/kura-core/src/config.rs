//! Configuration module
//!
//! Uploader settings read from the environment (after loading `.env`), with compiled-in
//! defaults for everything that is not set.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{GIB, KIB, MIB};

const API_ENDPOINT: &str = "http://localhost:8080";
const MAX_CONCURRENT_UPLOADS: usize = 4;
const MAX_FILE_SIZE_BYTES: u64 = 5 * GIB;
const ENCRYPTION_CHUNK_SIZE: usize = 4 * MIB as usize;
const CHUNKS_PER_PART: usize = 5;
const MAX_UPLOAD_URL_REQUEST: usize = 50;
const LIVE_PHOTO_ASSET_SIZE_LIMIT: u64 = 20 * MIB;
const THUMBNAIL_MAX_DIMENSION: u32 = 720;
const THUMBNAIL_MAX_SIZE_BYTES: usize = 100 * KIB as usize;
const THUMBNAIL_TIMEOUT_SECS: u64 = 30;
const THUMBNAIL_INITIAL_QUALITY: u8 = 70;
const THUMBNAIL_MIN_QUALITY: u8 = 50;
const THUMBNAIL_QUALITY_STEP: u8 = 10;
const RETRY_MAX_ATTEMPTS: u32 = 4;
const RETRY_BACKOFF_MS: [u64; 3] = [2000, 5000, 10000];
const STALE_REQUEST_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Thumbnail generation settings
#[derive(Clone, Debug)]
pub struct ThumbnailConfig {
    /// Long edge cap in pixels
    pub max_dimension: u32,
    pub max_size_bytes: usize,
    pub timeout_secs: u64,
    pub initial_quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_dimension: THUMBNAIL_MAX_DIMENSION,
            max_size_bytes: THUMBNAIL_MAX_SIZE_BYTES,
            timeout_secs: THUMBNAIL_TIMEOUT_SECS,
            initial_quality: THUMBNAIL_INITIAL_QUALITY,
            min_quality: THUMBNAIL_MIN_QUALITY,
            quality_step: THUMBNAIL_QUALITY_STEP,
        }
    }
}

impl ThumbnailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry policy for individual network calls
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait before retry `n` (the last entry repeats)
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            backoff_ms: RETRY_BACKOFF_MS.to_vec(),
        }
    }
}

/// Upload pipeline configuration
#[derive(Clone, Debug)]
pub struct UploaderConfig {
    pub api_endpoint: String,
    pub auth_token: Option<String>,
    pub max_concurrent_uploads: usize,
    pub max_file_size_bytes: u64,
    pub encryption_chunk_size: usize,
    pub chunks_per_part: usize,
    /// Files above this size go through multipart transport
    pub multipart_threshold_bytes: u64,
    pub max_upload_url_request: usize,
    pub live_photo_asset_size_limit: u64,
    pub thumbnail: ThumbnailConfig,
    pub retry: RetryConfig,
    pub stale_request_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// JSON index location; `None` keeps the known-files index in memory
    pub index_path: Option<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api_endpoint: API_ENDPOINT.to_string(),
            auth_token: None,
            max_concurrent_uploads: MAX_CONCURRENT_UPLOADS,
            max_file_size_bytes: MAX_FILE_SIZE_BYTES,
            encryption_chunk_size: ENCRYPTION_CHUNK_SIZE,
            chunks_per_part: CHUNKS_PER_PART,
            multipart_threshold_bytes: (ENCRYPTION_CHUNK_SIZE * CHUNKS_PER_PART) as u64,
            max_upload_url_request: MAX_UPLOAD_URL_REQUEST,
            live_photo_asset_size_limit: LIVE_PHOTO_ASSET_SIZE_LIMIT,
            thumbnail: ThumbnailConfig::default(),
            retry: RetryConfig::default(),
            stale_request_timeout_secs: STALE_REQUEST_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            index_path: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `ffprobe` in the directory of `ffmpeg_path`. Only the file name is replaced.
pub fn ffprobe_beside(ffmpeg_path: &str) -> String {
    Path::new(ffmpeg_path)
        .with_file_name("ffprobe")
        .to_string_lossy()
        .into_owned()
}

impl UploaderConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let encryption_chunk_size =
            env_or("KURA_ENCRYPTION_CHUNK_SIZE", defaults.encryption_chunk_size);
        let chunks_per_part = env_or("KURA_CHUNKS_PER_PART", defaults.chunks_per_part);
        let ffmpeg_path = env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string());
        let ffprobe_path =
            env::var("FFPROBE_PATH").unwrap_or_else(|_| ffprobe_beside(&ffmpeg_path));

        let config = Self {
            api_endpoint: env::var("KURA_API_URL")
                .unwrap_or_else(|_| API_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            auth_token: env::var("KURA_AUTH_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            max_concurrent_uploads: env_or(
                "KURA_MAX_CONCURRENT_UPLOADS",
                defaults.max_concurrent_uploads,
            ),
            max_file_size_bytes: env_or("KURA_MAX_FILE_SIZE_BYTES", defaults.max_file_size_bytes),
            encryption_chunk_size,
            chunks_per_part,
            multipart_threshold_bytes: env_or(
                "KURA_MULTIPART_THRESHOLD_BYTES",
                encryption_chunk_size.saturating_mul(chunks_per_part) as u64,
            ),
            max_upload_url_request: env_or(
                "KURA_MAX_UPLOAD_URL_REQUEST",
                defaults.max_upload_url_request,
            ),
            live_photo_asset_size_limit: env_or(
                "KURA_LIVE_PHOTO_ASSET_SIZE_LIMIT",
                defaults.live_photo_asset_size_limit,
            ),
            thumbnail: ThumbnailConfig {
                max_dimension: env_or("KURA_THUMBNAIL_MAX_DIMENSION", THUMBNAIL_MAX_DIMENSION),
                max_size_bytes: env_or("KURA_THUMBNAIL_MAX_SIZE_BYTES", THUMBNAIL_MAX_SIZE_BYTES),
                timeout_secs: env_or("KURA_THUMBNAIL_TIMEOUT_SECS", THUMBNAIL_TIMEOUT_SECS),
                ..ThumbnailConfig::default()
            },
            retry: RetryConfig {
                max_attempts: env_or("KURA_RETRY_MAX_ATTEMPTS", RETRY_MAX_ATTEMPTS),
                ..RetryConfig::default()
            },
            stale_request_timeout_secs: env_or(
                "KURA_STALE_REQUEST_TIMEOUT_SECS",
                STALE_REQUEST_TIMEOUT_SECS,
            ),
            request_timeout_secs: env_or("KURA_REQUEST_TIMEOUT_SECS", REQUEST_TIMEOUT_SECS),
            ffmpeg_path,
            ffprobe_path,
            index_path: env::var("KURA_INDEX_PATH").ok().map(PathBuf::from),
        };

        config.validate()?;
        tracing::debug!(
            api_endpoint = %config.api_endpoint,
            workers = config.max_concurrent_uploads,
            multipart_threshold_bytes = config.multipart_threshold_bytes,
            has_token = config.auth_token.is_some(),
            "Loaded uploader configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_concurrent_uploads == 0 {
            return Err(anyhow::anyhow!(
                "KURA_MAX_CONCURRENT_UPLOADS must be at least 1"
            ));
        }
        if self.encryption_chunk_size == 0 || self.encryption_chunk_size > u32::MAX as usize {
            return Err(anyhow::anyhow!(
                "KURA_ENCRYPTION_CHUNK_SIZE must be between 1 and {}",
                u32::MAX
            ));
        }
        if self.chunks_per_part == 0 {
            return Err(anyhow::anyhow!("KURA_CHUNKS_PER_PART must be at least 1"));
        }
        if self.max_upload_url_request == 0 {
            return Err(anyhow::anyhow!(
                "KURA_MAX_UPLOAD_URL_REQUEST must be at least 1"
            ));
        }
        if self.multipart_threshold_bytes == 0 {
            return Err(anyhow::anyhow!(
                "KURA_MULTIPART_THRESHOLD_BYTES must be at least 1"
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("KURA_RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.thumbnail.min_quality > self.thumbnail.initial_quality {
            return Err(anyhow::anyhow!(
                "thumbnail min quality {} is above initial quality {}",
                self.thumbnail.min_quality,
                self.thumbnail.initial_quality
            ));
        }
        Ok(())
    }

    /// Bytes carried by one multipart part.
    pub fn part_size(&self) -> usize {
        self.encryption_chunk_size.saturating_mul(self.chunks_per_part)
    }

    pub fn stale_request_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_request_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
