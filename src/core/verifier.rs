use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::error::IntegrityMismatch;
use crate::core::layout::SIDECAR_EXTENSION;
use crate::core::models::{ContentHash, MediaEntry, MediaKind};
use crate::core::sidecar::Sidecar;

/// Read size for streaming hashes.
pub const HASH_CHUNK_SIZE: usize = 8 * 1024;

/// Hash a file using BLAKE3, streaming in fixed chunks.
pub fn try_hash_file(path: &Path) -> io::Result<ContentHash> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; HASH_CHUNK_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ContentHash::from_hash(hasher.finalize()))
}

/// Like [`try_hash_file`], but an unreadable file yields `None` instead of an error.
pub fn hash_file(path: &Path) -> Option<ContentHash> {
    match try_hash_file(path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to hash file, treating as unverified");
            None
        }
    }
}

/// Check a file against an expected digest. No expected digest passes.
pub fn verify(path: &Path, expected: Option<&ContentHash>) -> bool {
    match expected {
        None => true,
        Some(expected) => hash_file(path).as_ref() == Some(expected),
    }
}

#[derive(Debug, Clone)]
struct CachedDigest {
    size: u64,
    modified: DateTime<Utc>,
    hash: ContentHash,
}

/// Cloneable hashing handle with a digest cache keyed by path, size and mtime.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    cache: Arc<Mutex<HashMap<PathBuf, CachedDigest>>>,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest of an entry's source file.
    ///
    /// The scan-time digest is reused while the file's size and modification
    /// time are unchanged. Returns `None` when the source cannot be read.
    pub fn source_hash(&self, entry: &MediaEntry) -> Option<ContentHash> {
        let (size, modified) = match stat(&entry.source_path) {
            Ok(stat) => stat,
            Err(e) => {
                warn!(path = %entry.source_path.display(), error = %e, "Failed to stat source");
                return None;
            }
        };

        if let Some(hash) = &entry.content_hash {
            if size == entry.size_bytes && modified == entry.modified {
                return Some(hash.clone());
            }
        }

        self.cached_hash(&entry.source_path, size, modified)
    }

    /// Digest of any file, served from the cache when size and mtime match.
    pub fn hash_path(&self, path: &Path) -> Option<ContentHash> {
        let (size, modified) = stat(path).ok()?;
        self.cached_hash(path, size, modified)
    }

    fn cached_hash(&self, path: &Path, size: u64, modified: DateTime<Utc>) -> Option<ContentHash> {
        let cached = self
            .cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(path).cloned());
        if let Some(cached) = cached {
            if cached.size == size && cached.modified == modified {
                return Some(cached.hash);
            }
        }

        let hash = hash_file(path)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                path.to_path_buf(),
                CachedDigest {
                    size,
                    modified,
                    hash: hash.clone(),
                },
            );
        }
        Some(hash)
    }

    /// Compare a file on disk with an expected size and optional digest.
    ///
    /// The destination is always rehashed; cached digests are only used for
    /// sources.
    pub fn matches(
        &self,
        path: &Path,
        digest: Option<&ContentHash>,
        size: u64,
    ) -> Result<(), IntegrityMismatch> {
        let actual = fs::metadata(path)
            .map_err(|_| IntegrityMismatch::Unreadable)?
            .len();
        if actual != size {
            return Err(IntegrityMismatch::Size {
                expected: size,
                actual,
            });
        }

        match digest {
            None => Ok(()),
            Some(expected) => match hash_file(path) {
                Some(ref actual) if actual == expected => Ok(()),
                Some(_) => Err(IntegrityMismatch::Digest),
                None => Err(IntegrityMismatch::Unreadable),
            },
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

fn stat(path: &Path) -> io::Result<(u64, DateTime<Utc>)> {
    let metadata = fs::metadata(path)?;
    Ok((metadata.len(), DateTime::<Utc>::from(metadata.modified()?)))
}

/// Result of re-checking a finished session folder.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub verified: usize,
    pub corrupted: Vec<PathBuf>,
    pub missing_metadata: usize,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

/// Re-verify every media file in a session folder against its sidecar.
pub async fn audit_session(dir: &Path) -> Result<AuditReport> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        info!(session = %dir.display(), "Starting session audit");

        let mut report = AuditReport::default();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().is_some_and(|e| e == SIDECAR_EXTENSION)
                || MediaKind::from_path(path).is_none()
            {
                continue;
            }

            let sidecar = match Sidecar::read_for(path) {
                Ok(sidecar) => sidecar,
                Err(e) => {
                    debug!(file = %path.display(), error = %e, "No readable sidecar");
                    report.missing_metadata += 1;
                    continue;
                }
            };

            let digest = sidecar.content_hash();
            match Verifier::new().matches(path, digest.as_ref(), sidecar.size) {
                Ok(()) => report.verified += 1,
                Err(mismatch) => {
                    warn!(file = %path.display(), %mismatch, "Audit found corrupted file");
                    report.corrupted.push(path.to_path_buf());
                }
            }
        }

        info!(
            verified = report.verified,
            corrupted = report.corrupted.len(),
            missing_metadata = report.missing_metadata,
            "Session audit complete"
        );
        Ok(report)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{MediaMetadata, PhotoMetadata};
    use tempfile::tempdir;

    fn entry_for(path: &Path) -> MediaEntry {
        let metadata = fs::metadata(path).unwrap();
        MediaEntry {
            source_path: path.to_path_buf(),
            relative_path: PathBuf::from(path.file_name().unwrap()),
            filename: path.file_name().unwrap().to_string_lossy().into_owned(),
            size_bytes: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified().unwrap()),
            created: None,
            content_hash: None,
            metadata: MediaMetadata::Photo(PhotoMetadata::default()),
        }
    }

    #[test]
    fn test_hash_matches_blake3() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        let content = vec![7u8; HASH_CHUNK_SIZE * 3 + 11];
        fs::write(&path, &content).unwrap();

        let expected = ContentHash::from_hash(blake3::hash(&content));
        assert_eq!(hash_file(&path), Some(expected.clone()));
        assert!(verify(&path, Some(&expected)));
    }

    #[test]
    fn test_hash_missing_file_is_none() {
        let temp = tempdir().unwrap();
        assert_eq!(hash_file(&temp.path().join("missing.jpg")), None);
    }

    #[test]
    fn test_verify_without_digest_passes() {
        let temp = tempdir().unwrap();
        assert!(verify(&temp.path().join("missing.jpg"), None));
    }

    #[test]
    fn test_verify_detects_changed_content() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        fs::write(&path, b"original content").unwrap();
        let digest = hash_file(&path).unwrap();

        fs::write(&path, b"corrupted content").unwrap();
        assert!(!verify(&path, Some(&digest)));
    }

    #[test]
    fn test_source_hash_reuses_scan_digest() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        fs::write(&path, b"photo bytes").unwrap();

        let mut entry = entry_for(&path);
        let sentinel = ContentHash::from_hex("not-a-real-digest");
        entry.content_hash = Some(sentinel.clone());

        let verifier = Verifier::new();
        assert_eq!(verifier.source_hash(&entry), Some(sentinel));
        assert_eq!(verifier.cached_len(), 0);
    }

    #[test]
    fn test_source_hash_recomputes_when_size_changes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        fs::write(&path, b"photo bytes").unwrap();

        let mut entry = entry_for(&path);
        entry.content_hash = Some(ContentHash::from_hex("stale"));
        entry.size_bytes += 1;

        let verifier = Verifier::new();
        let hash = verifier.source_hash(&entry).unwrap();
        assert_eq!(hash, ContentHash::from_hash(blake3::hash(b"photo bytes")));
        assert_eq!(verifier.cached_len(), 1);
    }

    #[test]
    fn test_matches_reports_size_then_digest() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.mov");
        fs::write(&path, b"12345").unwrap();
        let verifier = Verifier::new();

        assert_eq!(
            verifier.matches(&path, None, 6),
            Err(IntegrityMismatch::Size {
                expected: 6,
                actual: 5
            })
        );
        let wrong = ContentHash::from_hash(blake3::hash(b"54321"));
        assert_eq!(
            verifier.matches(&path, Some(&wrong), 5),
            Err(IntegrityMismatch::Digest)
        );
        assert_eq!(verifier.matches(&path, None, 5), Ok(()));
        assert_eq!(
            verifier.matches(&temp.path().join("gone.mov"), None, 5),
            Err(IntegrityMismatch::Unreadable)
        );
    }
}
