//! Embedded metadata extraction
//!
//! Images: EXIF `DateTimeOriginal` and GPS via kamadak-exif. Videos: container
//! `creation_time` and ISO 6709 location via ffprobe, bounded by a timeout. Both degrade to
//! the file's modification time and no location when anything goes wrong.

use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime};
use exif::{In, Reader, Tag, Value};
use kura_core::models::{ExtractedMetadata, FileSource, FileType, FileTypeInfo};
use tokio::process::Command;

use crate::reader::last_modified;

/// Capture time and location embedded in the asset itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddedMetadata {
    pub creation_time: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub struct MetadataExtractor {
    ffprobe_path: String,
    ffprobe_timeout: Duration,
}

impl MetadataExtractor {
    pub fn new(ffprobe_path: impl Into<String>, ffprobe_timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            ffprobe_timeout,
        }
    }

    /// Build the metadata record for one asset. Never fails: unreadable embedded data only
    /// means fewer fields are filled.
    pub async fn extract(
        &self,
        source: &FileSource,
        type_info: &FileTypeInfo,
        title: &str,
    ) -> ExtractedMetadata {
        let mut metadata = ExtractedMetadata::new(title, type_info.file_type);
        metadata.modification_time = last_modified(source).await;

        let embedded = match type_info.file_type {
            FileType::Image | FileType::LivePhoto => read_image_metadata(source).await,
            FileType::Video => self.read_video_metadata(source).await,
            FileType::Other => Ok(EmbeddedMetadata::default()),
        };

        match embedded {
            Ok(embedded) => {
                metadata.creation_time = embedded.creation_time;
                if let (Some(lat), Some(lon)) = (embedded.latitude, embedded.longitude) {
                    metadata.latitude = Some(lat);
                    metadata.longitude = Some(lon);
                }
            }
            Err(e) => {
                tracing::debug!(
                    title = %title,
                    error = %e,
                    "No usable embedded metadata, falling back to modification time"
                );
            }
        }

        if metadata.creation_time.is_none() {
            metadata.creation_time = metadata.modification_time;
        }
        metadata
    }

    #[tracing::instrument(skip(self, source), fields(process.executable.name = "ffprobe"))]
    async fn read_video_metadata(&self, source: &FileSource) -> Result<EmbeddedMetadata> {
        // ffprobe needs a path; spill in-memory assets to a temp file first
        let (path, _guard): (PathBuf, Option<tempfile::NamedTempFile>) = match source {
            FileSource::Path(path) => (path.clone(), None),
            FileSource::Memory { data, .. } => {
                let temp_file = tempfile::NamedTempFile::new()?;
                tokio::fs::write(temp_file.path(), data).await?;
                (temp_file.path().to_path_buf(), Some(temp_file))
            }
        };

        let start = std::time::Instant::now();
        let run = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(&path)
            .kill_on_drop(true)
            .output();
        // the child is killed when the future is dropped on timeout
        let output = tokio::time::timeout(self.ffprobe_timeout, run)
            .await
            .map_err(|_| anyhow!("ffprobe timed out after {:?}", self.ffprobe_timeout))?
            .context("Failed to execute ffprobe")?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let probe: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe output")?;
        let embedded = parse_probe_tags(&probe["format"]["tags"]);

        tracing::debug!(
            duration_ms = start.elapsed().as_millis(),
            has_creation_time = embedded.creation_time.is_some(),
            "Video probe completed"
        );
        Ok(embedded)
    }
}

async fn read_image_metadata(source: &FileSource) -> Result<EmbeddedMetadata> {
    let source = source.clone();
    tokio::task::spawn_blocking(move || match &source {
        FileSource::Path(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            parse_exif(&mut BufReader::new(file))
        }
        FileSource::Memory { data, .. } => parse_exif(&mut Cursor::new(data.as_ref())),
    })
    .await
    .context("EXIF task panicked")?
}

/// Parse EXIF capture time and GPS position from any container kamadak-exif understands
pub fn parse_exif<R: BufRead + Seek>(reader: &mut R) -> Result<EmbeddedMetadata> {
    let exif = Reader::new()
        .read_from_container(reader)
        .context("Failed to read EXIF")?;

    let creation_time = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
        .iter()
        .find_map(|tag| {
            let field = exif.get_field(*tag, In::PRIMARY)?;
            parse_exif_datetime(&ascii_value(&field.value)?)
        });

    let latitude = gps_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
    let longitude = gps_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");
    let (latitude, longitude) = match (latitude, longitude) {
        (Some(lat), Some(lon)) if !(lat == 0.0 && lon == 0.0) => (Some(lat), Some(lon)),
        _ => (None, None),
    };

    Ok(EmbeddedMetadata {
        creation_time,
        latitude,
        longitude,
    })
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts
            .first()
            .map(|p| String::from_utf8_lossy(p).trim().to_string()),
        _ => None,
    }
}

/// `YYYY:MM:DD HH:MM:SS` to microseconds since the epoch
pub fn parse_exif_datetime(value: &str) -> Option<i64> {
    let parsed = NaiveDateTime::parse_from_str(value.trim(), "%Y:%m:%d %H:%M:%S").ok()?;
    Some(parsed.and_utc().timestamp_micros())
}

fn gps_coordinate(exif: &exif::Exif, tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let degrees = match &field.value {
        Value::Rational(parts) if parts.len() >= 3 => {
            parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0
        }
        _ => return None,
    };
    if !degrees.is_finite() {
        return None;
    }

    let negative = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(|f| ascii_value(&f.value))
        .map(|r| r.eq_ignore_ascii_case(negative_ref))
        .unwrap_or(false);

    Some(if negative { -degrees } else { degrees })
}

fn parse_probe_tags(tags: &serde_json::Value) -> EmbeddedMetadata {
    let creation_time = tags["creation_time"]
        .as_str()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_micros());

    let location = ["location", "com.apple.quicktime.location.ISO6709"]
        .iter()
        .find_map(|key| tags[*key].as_str().and_then(parse_iso6709));

    EmbeddedMetadata {
        creation_time,
        latitude: location.map(|(lat, _)| lat),
        longitude: location.map(|(_, lon)| lon),
    }
}

/// Parse the leading `±DD.DDDD±DDD.DDDD` pair of an ISO 6709 string
pub fn parse_iso6709(value: &str) -> Option<(f64, f64)> {
    let value = value.trim().trim_end_matches('/');
    let mut starts = value
        .char_indices()
        .filter(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i);

    let lat_start = starts.next()?;
    let lon_start = starts.next()?;
    let lon_end = starts.next().unwrap_or(value.len());

    let lat: f64 = value[lat_start..lon_start].parse().ok()?;
    let lon: f64 = value[lon_start..lon_end].parse().ok()?;
    if lat == 0.0 && lon == 0.0 {
        return None;
    }
    Some((lat, lon))
}
