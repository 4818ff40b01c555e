use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::error::{EntryFailure, PartialScan};

/// Whether a file on the device is a photo or a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub const PHOTO_EXTENSIONS: &'static [&'static str] =
        &["jpg", "jpeg", "png", "heic", "tiff", "tif"];
    pub const VIDEO_EXTENSIONS: &'static [&'static str] =
        &["mp4", "mov", "m4v", "3gp", "avi", "mkv"];

    /// Classify a path by its (case-insensitive) extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if Self::PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Photo)
        } else if Self::VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
        }
    }

    /// Name of the per-kind folder inside a session.
    pub fn folder_name(&self) -> &'static str {
        match self {
            Self::Photo => "Photos",
            Self::Video => "Videos",
        }
    }
}

/// Which media kinds a scan collects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KindFilter {
    #[default]
    All,
    Photos,
    Videos,
}

impl KindFilter {
    pub fn includes(&self, kind: MediaKind) -> bool {
        match self {
            Self::All => true,
            Self::Photos => kind == MediaKind::Photo,
            Self::Videos => kind == MediaKind::Video,
        }
    }
}

/// 1-based inclusive slice of the kind-ordered candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFilter {
    pub start: usize,
    pub end: usize,
}

impl RangeFilter {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Zero-based half-open bounds for a list of `len` items.
    pub fn bounds(&self, len: usize) -> (usize, usize) {
        let start = self.start.saturating_sub(1).min(len);
        let end = self.end.min(len).max(start);
        (start, end)
    }

    pub fn apply<T>(&self, mut items: Vec<T>) -> Vec<T> {
        let (start, end) = self.bounds(items.len());
        items.truncate(end);
        items.drain(..start);
        items
    }
}

impl FromStr for RangeFilter {
    type Err = String;

    /// Parses `START-END`, e.g. `1-100`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END, got '{s}'"))?;
        let start = start
            .trim()
            .parse()
            .map_err(|e| format!("invalid range start '{start}': {e}"))?;
        let end = end
            .trim()
            .parse()
            .map_err(|e| format!("invalid range end '{end}': {e}"))?;
        Ok(Self::new(start, end))
    }
}

/// Hex-encoded BLAKE3 digest of a file's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_hash(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoMetadata {
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub dimensions: Option<(u32, u32)>,
    pub orientation: Option<u32>,
    /// Raw EXIF date string, e.g. `2024:06:01 14:03:22`.
    pub creation_date: Option<String>,
    pub exif_data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_secs: Option<f64>,
    /// `WIDTHxHEIGHT`
    pub resolution: Option<String>,
    pub codec: Option<String>,
    pub frame_rate: Option<f64>,
}

/// Kind-specific metadata. The variant decides the entry's `MediaKind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaMetadata {
    Photo(PhotoMetadata),
    Video(VideoMetadata),
}

impl MediaMetadata {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Photo(_) => MediaKind::Photo,
            Self::Video(_) => MediaKind::Video,
        }
    }
}

/// One media file found on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub source_path: PathBuf,
    /// Path relative to the mount root.
    pub relative_path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub created: Option<DateTime<Utc>>,
    /// `None` means the entry is unverified.
    pub content_hash: Option<ContentHash>,
    pub metadata: MediaMetadata,
}

impl MediaEntry {
    pub fn kind(&self) -> MediaKind {
        self.metadata.kind()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub total: usize,
    pub photos: usize,
    pub videos: usize,
    pub total_bytes: u64,
}

/// Read-only snapshot of a scan: photos first, then videos, each path-sorted.
#[derive(Debug, Clone)]
pub struct Inventory {
    root: PathBuf,
    entries: Vec<MediaEntry>,
    partial: Option<PartialScan>,
}

impl Inventory {
    pub fn new(root: impl Into<PathBuf>, mut entries: Vec<MediaEntry>, partial: Option<PartialScan>) -> Self {
        entries.sort_by(|a, b| {
            a.kind()
                .cmp(&b.kind())
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        entries.dedup_by(|a, b| a.source_path == b.source_path);

        Self {
            root: root.into(),
            entries,
            partial,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[MediaEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MediaEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set when the scan was stopped before visiting every candidate.
    pub fn partial(&self) -> Option<&PartialScan> {
        self.partial.as_ref()
    }

    pub fn summary(&self) -> InventorySummary {
        self.entries
            .iter()
            .fold(InventorySummary::default(), |mut acc, entry| {
                acc.total += 1;
                acc.total_bytes += entry.size_bytes;
                match entry.kind() {
                    MediaKind::Photo => acc.photos += 1,
                    MediaKind::Video => acc.videos += 1,
                }
                acc
            })
    }
}

impl<'a> IntoIterator for &'a Inventory {
    type Item = &'a MediaEntry;
    type IntoIter = std::slice::Iter<'a, MediaEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Per-entry transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Copying,
    Verifying,
    Done,
    /// Copied and verified, but flagged for operator attention.
    Warned,
    Skipped,
    Failed,
    FailedCorrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryWarning {
    /// Zero-byte source: the copy matches vacuously.
    EmptySource,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub entry: MediaEntry,
    pub state: EntryState,
    pub destination: Option<PathBuf>,
    /// Digest the destination was verified against, if any.
    pub digest: Option<ContentHash>,
    pub error: Option<EntryFailure>,
    pub warning: Option<EntryWarning>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounts {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub warned: usize,
}

impl TransferCounts {
    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped + self.warned
    }

    pub fn record(&mut self, state: EntryState) {
        match state {
            EntryState::Done => self.success += 1,
            EntryState::Warned => self.warned += 1,
            EntryState::Skipped => self.skipped += 1,
            EntryState::Failed | EntryState::FailedCorrupt => self.failed += 1,
            EntryState::Pending | EntryState::Copying | EntryState::Verifying => {}
        }
    }
}

impl fmt::Display for TransferCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} copied, {} skipped, {} failed, {} warned of {} total",
            self.success,
            self.skipped,
            self.failed,
            self.warned,
            self.total()
        )
    }
}

/// Outcome of a transfer run, complete or not.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub counts: TransferCounts,
    pub destination: PathBuf,
    pub outcomes: Vec<EntryOutcome>,
    pub cancelled: bool,
}

impl TransferResult {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            counts: TransferCounts::default(),
            destination: destination.into(),
            outcomes: Vec::new(),
            cancelled: false,
        }
    }

    pub fn push(&mut self, outcome: EntryOutcome) {
        self.counts.record(outcome.state);
        self.outcomes.push(outcome);
    }

    pub fn corrupted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == EntryState::FailedCorrupt)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, metadata: MediaMetadata, size: u64) -> MediaEntry {
        let source_path = PathBuf::from(path);
        MediaEntry {
            filename: source_path.file_name().unwrap().to_string_lossy().into_owned(),
            relative_path: source_path.clone(),
            source_path,
            size_bytes: size,
            modified: Utc::now(),
            created: None,
            content_hash: None,
            metadata,
        }
    }

    #[test]
    fn test_media_kind_from_path() {
        assert_eq!(MediaKind::from_path(Path::new("a/IMG_0001.HEIC")), Some(MediaKind::Photo));
        assert_eq!(MediaKind::from_path(Path::new("a/IMG_0002.jpeg")), Some(MediaKind::Photo));
        assert_eq!(MediaKind::from_path(Path::new("a/IMG_0003.MOV")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("a/IMG_0004.AAE")), None);
        assert_eq!(MediaKind::from_path(Path::new("a/noext")), None);
    }

    #[test]
    fn test_range_filter_apply() {
        let items: Vec<u32> = (1..=50).collect();
        assert_eq!(RangeFilter::new(1, 10).apply(items.clone()), (1..=10).collect::<Vec<_>>());
        assert_eq!(RangeFilter::new(45, 100).apply(items.clone()), (45..=50).collect::<Vec<_>>());
        assert_eq!(RangeFilter::new(0, 2).apply(items.clone()), vec![1, 2]);
        assert!(RangeFilter::new(20, 10).apply(items.clone()).is_empty());
        assert!(RangeFilter::new(60, 70).apply(items).is_empty());
    }

    #[test]
    fn test_range_filter_parse() {
        assert_eq!("1-10".parse::<RangeFilter>().unwrap(), RangeFilter::new(1, 10));
        assert_eq!(" 5 - 7".parse::<RangeFilter>().unwrap(), RangeFilter::new(5, 7));
        assert!("10".parse::<RangeFilter>().is_err());
        assert!("a-b".parse::<RangeFilter>().is_err());
    }

    #[test]
    fn test_inventory_orders_photos_before_videos() {
        let inventory = Inventory::new(
            "/mnt",
            vec![
                entry("/mnt/DCIM/b.MOV", MediaMetadata::Video(VideoMetadata::default()), 3),
                entry("/mnt/DCIM/c.JPG", MediaMetadata::Photo(PhotoMetadata::default()), 2),
                entry("/mnt/DCIM/a.MOV", MediaMetadata::Video(VideoMetadata::default()), 1),
                entry("/mnt/DCIM/a.JPG", MediaMetadata::Photo(PhotoMetadata::default()), 4),
            ],
            None,
        );

        let names: Vec<_> = inventory.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, ["a.JPG", "c.JPG", "a.MOV", "b.MOV"]);

        let summary = inventory.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.photos, 2);
        assert_eq!(summary.videos, 2);
        assert_eq!(summary.total_bytes, 10);
    }

    #[test]
    fn test_transfer_counts_total() {
        let mut counts = TransferCounts::default();
        for state in [
            EntryState::Done,
            EntryState::Done,
            EntryState::Skipped,
            EntryState::FailedCorrupt,
            EntryState::Failed,
            EntryState::Warned,
        ] {
            counts.record(state);
        }
        assert_eq!(counts.success, 2);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.warned, 1);
        assert_eq!(counts.total(), 6);
    }
}
