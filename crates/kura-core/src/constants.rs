//! Shared constants

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Leading bytes inspected by the type sniffer.
pub const SNIFF_WINDOW_BYTES: usize = 4100;

/// Filename extension that marks a sidecar metadata file.
pub const SIDECAR_EXTENSION: &str = "json";

/// Takeout clips long titles to this many characters when naming sidecars.
pub const SIDECAR_TITLE_MAX_CHARS: usize = 46;

/// Maximum number of entries requested per collection diff page.
pub const COLLECTION_DIFF_PAGE_LIMIT: usize = 500;
