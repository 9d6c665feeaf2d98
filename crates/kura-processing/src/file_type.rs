//! File type detection
//!
//! Magic bytes first, then a table of extensions the sniffer is known to miss (HEIC variants,
//! camera RAW, some containers), then `Other`.

use anyhow::Result;
use image::ImageFormat;
use kura_core::constants::SNIFF_WINDOW_BYTES;
use kura_core::models::{extension_of, FileSource, FileType, FileTypeInfo};

use crate::reader::read_prefix;

/// Extensions recognised when sniffing gives no answer
const EXTENSION_TABLE: &[(&str, FileType, &str)] = &[
    ("jpg", FileType::Image, "image/jpeg"),
    ("jpeg", FileType::Image, "image/jpeg"),
    ("png", FileType::Image, "image/png"),
    ("gif", FileType::Image, "image/gif"),
    ("webp", FileType::Image, "image/webp"),
    ("bmp", FileType::Image, "image/bmp"),
    ("tif", FileType::Image, "image/tiff"),
    ("tiff", FileType::Image, "image/tiff"),
    ("heic", FileType::Image, "image/heic"),
    ("heif", FileType::Image, "image/heif"),
    ("avif", FileType::Image, "image/avif"),
    ("dng", FileType::Image, "image/x-adobe-dng"),
    ("cr2", FileType::Image, "image/x-canon-cr2"),
    ("cr3", FileType::Image, "image/x-canon-cr3"),
    ("nef", FileType::Image, "image/x-nikon-nef"),
    ("arw", FileType::Image, "image/x-sony-arw"),
    ("orf", FileType::Image, "image/x-olympus-orf"),
    ("rw2", FileType::Image, "image/x-panasonic-rw2"),
    ("raf", FileType::Image, "image/x-fuji-raf"),
    ("pef", FileType::Image, "image/x-pentax-pef"),
    ("srw", FileType::Image, "image/x-samsung-srw"),
    ("mov", FileType::Video, "video/quicktime"),
    ("mp4", FileType::Video, "video/mp4"),
    ("m4v", FileType::Video, "video/x-m4v"),
    ("mkv", FileType::Video, "video/x-matroska"),
    ("webm", FileType::Video, "video/webm"),
    ("avi", FileType::Video, "video/x-msvideo"),
    ("3gp", FileType::Video, "video/3gpp"),
    ("mts", FileType::Video, "video/mp2t"),
    ("m2ts", FileType::Video, "video/mp2t"),
    ("wmv", FileType::Video, "video/x-ms-wmv"),
    ("mpg", FileType::Video, "video/mpeg"),
    ("mpeg", FileType::Video, "video/mpeg"),
];

/// TIFF-based RAW formats that sniff as plain TIFF
const TIFF_RAW_EXTENSIONS: &[&str] = &["dng", "cr2", "nef", "arw", "orf", "pef", "srw", "rw2"];

/// Read the leading window of an asset and classify it
pub async fn get_file_type(source: &FileSource) -> Result<FileTypeInfo> {
    let prefix = read_prefix(source, SNIFF_WINDOW_BYTES).await?;
    Ok(detect_file_type(&prefix, &source.name()))
}

/// Classify an asset from its leading bytes and name
pub fn detect_file_type(prefix: &[u8], file_name: &str) -> FileTypeInfo {
    let extension = extension_of(file_name);

    if let Some(info) = sniff(prefix, extension.as_deref()) {
        return info;
    }

    if let Some(info) = extension.as_deref().and_then(from_extension) {
        tracing::debug!(
            file_name = %file_name,
            exact_type = %info.exact_type,
            "File type resolved from extension"
        );
        return info;
    }

    FileTypeInfo::new(
        FileType::Other,
        extension.unwrap_or_else(|| "unknown".to_string()),
        None,
    )
}

fn from_extension(ext: &str) -> Option<FileTypeInfo> {
    EXTENSION_TABLE
        .iter()
        .find(|(e, _, _)| *e == ext)
        .map(|(e, file_type, mime)| FileTypeInfo::new(*file_type, *e, Some(*mime)))
}

fn sniff(prefix: &[u8], extension: Option<&str>) -> Option<FileTypeInfo> {
    if prefix.len() >= 12 && &prefix[4..8] == b"ftyp" {
        return Some(sniff_iso_bmff(&prefix[8..12]));
    }

    if prefix.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let is_webm = prefix.windows(4).any(|w| w == b"webm");
        return Some(if is_webm {
            FileTypeInfo::new(FileType::Video, "webm", Some("video/webm"))
        } else {
            FileTypeInfo::new(FileType::Video, "mkv", Some("video/x-matroska"))
        });
    }

    if prefix.len() >= 12 && prefix.starts_with(b"RIFF") && &prefix[8..12] == b"AVI " {
        return Some(FileTypeInfo::new(
            FileType::Video,
            "avi",
            Some("video/x-msvideo"),
        ));
    }

    let format = image::guess_format(prefix).ok()?;
    if format == ImageFormat::Tiff {
        if let Some(raw) = extension.filter(|e| TIFF_RAW_EXTENSIONS.contains(e)) {
            return from_extension(raw);
        }
    }

    let exact_type = format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("unknown");
    Some(FileTypeInfo::new(
        FileType::Image,
        exact_type,
        Some(format.to_mime_type()),
    ))
}

fn sniff_iso_bmff(brand: &[u8]) -> FileTypeInfo {
    let brand = String::from_utf8_lossy(brand).trim().to_ascii_lowercase();
    match brand.as_str() {
        "heic" | "heix" | "hevc" | "hevx" | "heim" | "heis" => {
            FileTypeInfo::new(FileType::Image, "heic", Some("image/heic"))
        }
        "mif1" | "msf1" => FileTypeInfo::new(FileType::Image, "heif", Some("image/heif")),
        "avif" | "avis" => FileTypeInfo::new(FileType::Image, "avif", Some("image/avif")),
        "crx" => FileTypeInfo::new(FileType::Image, "cr3", Some("image/x-canon-cr3")),
        "qt" => FileTypeInfo::new(FileType::Video, "mov", Some("video/quicktime")),
        "m4v" | "m4vh" | "m4vp" => FileTypeInfo::new(FileType::Video, "m4v", Some("video/x-m4v")),
        b if b.starts_with("3g") => FileTypeInfo::new(FileType::Video, "3gp", Some("video/3gpp")),
        _ => FileTypeInfo::new(FileType::Video, "mp4", Some("video/mp4")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 0x18];
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(brand);
        data.extend_from_slice(&[0u8; 16]);
        data
    }

    #[test]
    fn test_png_sniffed_regardless_of_name() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();

        let info = detect_file_type(&buffer, "misnamed.mov");
        assert_eq!(info.file_type, FileType::Image);
        assert_eq!(info.exact_type, "png");
        assert_eq!(info.mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_iso_bmff_brands() {
        assert_eq!(detect_file_type(&ftyp(b"heic"), "x").exact_type, "heic");
        assert_eq!(
            detect_file_type(&ftyp(b"heic"), "x").file_type,
            FileType::Image
        );
        assert_eq!(detect_file_type(&ftyp(b"qt  "), "x").exact_type, "mov");
        assert_eq!(detect_file_type(&ftyp(b"isom"), "x").exact_type, "mp4");
        assert_eq!(
            detect_file_type(&ftyp(b"mp42"), "x").file_type,
            FileType::Video
        );
    }

    #[test]
    fn test_extension_fallback() {
        let info = detect_file_type(b"not a known signature", "IMG_0001.HEIC");
        assert_eq!(info.file_type, FileType::Image);
        assert_eq!(info.exact_type, "heic");

        let info = detect_file_type(&[], "clip.mts");
        assert_eq!(info.file_type, FileType::Video);
    }

    #[test]
    fn test_unknown_defaults_to_other() {
        let info = detect_file_type(b"plain text", "notes.txt");
        assert_eq!(info.file_type, FileType::Other);
        assert_eq!(info.exact_type, "txt");
        assert!(!info.is_supported());
    }

    #[test]
    fn test_tiff_raw_uses_extension() {
        let mut tiff = b"II*\0".to_vec();
        tiff.extend_from_slice(&[8, 0, 0, 0]);
        let info = detect_file_type(&tiff, "DSC_0001.NEF");
        assert_eq!(info.exact_type, "nef");
        assert_eq!(info.file_type, FileType::Image);
    }
}
