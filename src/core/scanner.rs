use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use walkdir::WalkDir;

use crate::core::error::{EngineError, PartialScan, is_device_removed_error};
use crate::core::metadata::{VideoProbe, extract_photo};
use crate::core::models::{
    Inventory, KindFilter, MediaEntry, MediaKind, MediaMetadata, RangeFilter,
};
use crate::core::verifier::Verifier;
use crate::logging::LogThrottle;

/// Top-level media folder every camera-style device exposes.
pub const MEDIA_DIR: &str = "DCIM";

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub kind_filter: KindFilter,
    pub range: Option<RangeFilter>,
    pub batch_size: usize,
    /// Pause between batches to keep slow device links responsive.
    pub batch_pause: Duration,
    pub compute_hashes: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            kind_filter: KindFilter::All,
            range: None,
            batch_size: 20,
            batch_pause: Duration::from_millis(50),
            compute_hashes: true,
        }
    }
}

/// Sent before each item is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanTick {
    pub processed: usize,
    pub total: usize,
    pub current_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaCount {
    pub photos: usize,
    pub videos: usize,
}

impl MediaCount {
    pub fn total(&self) -> usize {
        self.photos + self.videos
    }
}

#[derive(Debug, Clone)]
pub struct Scanner {
    options: ScanOptions,
    probe: VideoProbe,
    verifier: Verifier,
}

impl Scanner {
    pub fn new(options: ScanOptions, probe: VideoProbe, verifier: Verifier) -> Self {
        Self {
            options,
            probe,
            verifier,
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Media files under `<root>/DCIM`, photos first then videos, each path-sorted.
    pub fn collect_candidates(&self, root: &Path) -> Result<Vec<(PathBuf, MediaKind)>, EngineError> {
        if !root.is_dir() {
            return Err(EngineError::NotFound {
                what: "mount root",
                path: root.to_path_buf(),
            });
        }
        let media_dir = root.join(MEDIA_DIR);
        if !media_dir.is_dir() {
            return Err(EngineError::NotFound {
                what: "media directory",
                path: media_dir,
            });
        }

        let mut photos = Vec::new();
        let mut videos = Vec::new();

        for entry in WalkDir::new(&media_dir).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.io_error().is_some_and(is_device_removed_error) && !root.exists() {
                        return Err(EngineError::DeviceRemoved {
                            path: root.to_path_buf(),
                        });
                    }
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = MediaKind::from_path(entry.path()) else {
                continue;
            };
            if !self.options.kind_filter.includes(kind) {
                continue;
            }
            match kind {
                MediaKind::Photo => photos.push(entry.into_path()),
                MediaKind::Video => videos.push(entry.into_path()),
            }
        }

        photos.sort();
        videos.sort();

        Ok(photos
            .into_iter()
            .map(|p| (p, MediaKind::Photo))
            .chain(videos.into_iter().map(|p| (p, MediaKind::Video)))
            .collect())
    }

    /// Cheap walk without metadata extraction.
    pub fn count(&self, root: &Path) -> Result<MediaCount, EngineError> {
        let candidates = self.collect_candidates(root)?;
        let photos = candidates
            .iter()
            .filter(|(_, kind)| *kind == MediaKind::Photo)
            .count();
        Ok(MediaCount {
            photos,
            videos: candidates.len() - photos,
        })
    }

    /// Scan on the current thread.
    ///
    /// `observer` sees every item before it is processed and may return
    /// `Break` to stop early; the entries built so far are still returned,
    /// marked with a [`PartialScan`].
    pub fn scan_blocking<F>(&self, root: &Path, mut observer: F) -> Result<Inventory, EngineError>
    where
        F: FnMut(&ScanTick) -> ControlFlow<()>,
    {
        let started = Instant::now();
        let mut candidates = self.collect_candidates(root)?;
        if let Some(range) = self.options.range {
            candidates = range.apply(candidates);
        }

        let total = candidates.len();
        let batch_size = self.options.batch_size.max(1);
        let throttle = LogThrottle::new(Duration::from_millis(500));
        info!(root = %root.display(), total, "Scanning media");

        let mut entries = Vec::with_capacity(total);
        let mut partial = None;

        for (index, (path, kind)) in candidates.iter().enumerate() {
            if index > 0 && index % batch_size == 0 && !self.options.batch_pause.is_zero() {
                thread::sleep(self.options.batch_pause);
            }

            let tick = ScanTick {
                processed: index,
                total,
                current_name: file_name(path),
            };
            if observer(&tick).is_break() {
                info!(processed = index, total, "Scan stopped on request");
                partial = Some(PartialScan {
                    processed: index,
                    total,
                });
                break;
            }

            if throttle.should_log() {
                debug!(processed = index, total, file = %tick.current_name, "Scan progress");
            }

            match self.build_entry(root, path, *kind) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    if e.is_device_removed() && !root.exists() {
                        return Err(EngineError::DeviceRemoved {
                            path: root.to_path_buf(),
                        });
                    }
                    warn!(error = %e, "Skipping file");
                }
            }
        }

        let inventory = Inventory::new(root, entries, partial);
        let summary = inventory.summary();
        info!(
            photos = summary.photos,
            videos = summary.videos,
            total_bytes = summary.total_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );
        Ok(inventory)
    }

    /// Scan on a blocking worker, streaming ticks without waiting on the receiver.
    pub async fn scan(
        &self,
        root: &Path,
        tx: mpsc::Sender<ScanTick>,
        cancel: CancellationToken,
    ) -> Result<Inventory, EngineError> {
        let scanner = self.clone();
        let root = root.to_path_buf();
        let span = info_span!("scan", root = %root.display());

        tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            scanner.scan_blocking(&root, |tick| {
                if cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                let _ = tx.try_send(tick.clone());
                ControlFlow::Continue(())
            })
        })
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))?
    }

    fn build_entry(&self, root: &Path, path: &Path, kind: MediaKind) -> Result<MediaEntry, EngineError> {
        let stat = fs::metadata(path).map_err(|e| EngineError::io(path, e))?;
        let modified = stat.modified().map_err(|e| EngineError::io(path, e))?;

        let metadata = match kind {
            MediaKind::Photo => MediaMetadata::Photo(extract_photo(path)),
            MediaKind::Video => MediaMetadata::Video(self.probe.probe(path)),
        };
        let content_hash = if self.options.compute_hashes {
            self.verifier.hash_path(path)
        } else {
            None
        };

        Ok(MediaEntry {
            source_path: path.to_path_buf(),
            relative_path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
            filename: file_name(path),
            size_bytes: stat.len(),
            modified: DateTime::<Utc>::from(modified),
            created: stat.created().ok().map(DateTime::<Utc>::from),
            content_hash,
            metadata,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scanner(options: ScanOptions) -> Scanner {
        Scanner::new(
            ScanOptions {
                batch_pause: Duration::ZERO,
                ..options
            },
            VideoProbe::new("/nonexistent/ffprobe"),
            Verifier::new(),
        )
    }

    fn device(files: &[&str]) -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        for file in files {
            let path = temp.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        temp
    }

    #[test]
    fn test_candidates_skip_unknown_extensions() {
        let temp = device(&[
            "DCIM/100APPLE/IMG_0002.MOV",
            "DCIM/100APPLE/IMG_0001.HEIC",
            "DCIM/100APPLE/IMG_0001.AAE",
            "DCIM/.thumbs",
        ]);
        let candidates = scanner(ScanOptions::default())
            .collect_candidates(temp.path())
            .unwrap();

        let kinds: Vec<_> = candidates.iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, [MediaKind::Photo, MediaKind::Video]);
    }

    #[test]
    fn test_count_respects_kind_filter() {
        let temp = device(&["DCIM/a.jpg", "DCIM/b.png", "DCIM/c.mp4"]);

        let all = scanner(ScanOptions::default()).count(temp.path()).unwrap();
        assert_eq!(all, MediaCount { photos: 2, videos: 1 });

        let videos = scanner(ScanOptions {
            kind_filter: KindFilter::Videos,
            ..Default::default()
        })
        .count(temp.path())
        .unwrap();
        assert_eq!(videos, MediaCount { photos: 0, videos: 1 });
    }

    #[test]
    fn test_missing_media_dir_is_not_found() {
        let temp = tempdir().unwrap();
        let err = scanner(ScanOptions::default())
            .scan_blocking(temp.path(), |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = scanner(ScanOptions::default())
            .count(&temp.path().join("gone"))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { what: "mount root", .. }));
    }

    #[test]
    fn test_scan_populates_entries() {
        let temp = device(&["DCIM/100APPLE/IMG_0001.JPG", "DCIM/100APPLE/IMG_0002.MOV"]);
        let inventory = scanner(ScanOptions::default())
            .scan_blocking(temp.path(), |_| ControlFlow::Continue(()))
            .unwrap();

        assert!(inventory.partial().is_none());
        let photo = &inventory.entries()[0];
        assert_eq!(photo.filename, "IMG_0001.JPG");
        assert_eq!(photo.relative_path, PathBuf::from("DCIM/100APPLE/IMG_0001.JPG"));
        assert_eq!(photo.size_bytes, "DCIM/100APPLE/IMG_0001.JPG".len() as u64);
        assert!(photo.content_hash.is_some());
        assert!(matches!(inventory.entries()[1].metadata, MediaMetadata::Video(_)));
    }

    #[test]
    fn test_scan_without_hashing_leaves_entries_unverified() {
        let temp = device(&["DCIM/a.jpg"]);
        let inventory = scanner(ScanOptions {
            compute_hashes: false,
            ..Default::default()
        })
        .scan_blocking(temp.path(), |_| ControlFlow::Continue(()))
        .unwrap();
        assert!(inventory.entries()[0].content_hash.is_none());
    }

    #[test]
    fn test_ticks_precede_each_item() {
        let temp = device(&["DCIM/a.jpg", "DCIM/b.jpg", "DCIM/c.jpg"]);
        let mut ticks = Vec::new();
        scanner(ScanOptions {
            batch_size: 2,
            ..Default::default()
        })
        .scan_blocking(temp.path(), |tick| {
            ticks.push((tick.processed, tick.total, tick.current_name.clone()));
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(
            ticks,
            [
                (0, 3, "a.jpg".to_string()),
                (1, 3, "b.jpg".to_string()),
                (2, 3, "c.jpg".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_async_scan_cancelled_before_start_is_empty() {
        let temp = device(&["DCIM/a.jpg", "DCIM/b.jpg"]);
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let inventory = scanner(ScanOptions::default())
            .scan(temp.path(), tx, cancel)
            .await
            .unwrap();
        assert!(inventory.is_empty());
        assert_eq!(inventory.partial(), Some(&PartialScan { processed: 0, total: 2 }));
    }
}
