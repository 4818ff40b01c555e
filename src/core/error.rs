//! Error taxonomy for scanning and transfer.
//!
//! `EngineError` covers both whole-run failures (missing mount root, device
//! removed, history store unavailable) and the per-entry failures that are
//! recorded in a `TransferResult` without stopping the run.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::models::TransferResult;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{what} not found: {}", .path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("integrity check failed for {}: {mismatch}", .path.display())]
    Integrity {
        path: PathBuf,
        mismatch: IntegrityMismatch,
    },

    #[error(
        "format violation: {} would be written as {}",
        .source_path.display(),
        .destination.display()
    )]
    FormatViolation {
        source_path: PathBuf,
        destination: PathBuf,
    },

    #[error("device removed during transfer: {}", .path.display())]
    DeviceRemoved { path: PathBuf },

    #[error("history store failed: {0}")]
    History(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the underlying I/O error looks like the device went away.
    pub fn is_device_removed(&self) -> bool {
        match self {
            Self::DeviceRemoved { .. } => true,
            Self::Io { source, .. } => is_device_removed_error(source),
            _ => false,
        }
    }
}

/// Why a destination failed post-copy verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityMismatch {
    Size { expected: u64, actual: u64 },
    Digest,
    Unreadable,
}

impl std::fmt::Display for IntegrityMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Size { expected, actual } => {
                write!(f, "size mismatch (expected {expected}, got {actual})")
            }
            Self::Digest => write!(f, "hash mismatch"),
            Self::Unreadable => write!(f, "destination unreadable"),
        }
    }
}

/// A scan that was stopped on request before visiting every candidate.
///
/// Informational only: the inventory built so far is still returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("scan stopped after {processed} of {total} items")]
pub struct PartialScan {
    pub processed: usize,
    pub total: usize,
}

/// A transfer that ended early on a catastrophic condition.
///
/// Carries whatever had been accumulated so the caller can still report
/// counts and the destination path.
#[derive(Debug, Error)]
#[error("transfer aborted: {error}")]
pub struct TransferAborted {
    #[source]
    pub error: EngineError,
    pub partial: TransferResult,
}

/// Category of a per-entry failure, kept on the outcome record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Io,
    FormatViolation,
    Integrity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&EngineError> for EntryFailure {
    fn from(err: &EngineError) -> Self {
        let kind = match err {
            EngineError::FormatViolation { .. } => FailureKind::FormatViolation,
            EngineError::Integrity { .. } => FailureKind::Integrity,
            _ => FailureKind::Io,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Check if an I/O error indicates the device has been removed
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => true,
        _ => matches!(
            error.raw_os_error(),
            Some(libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_device_removed_error_eio() {
        let error = io::Error::from_raw_os_error(libc::EIO);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_enodev() {
        let error = io::Error::from_raw_os_error(libc::ENODEV);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_permission_denied() {
        let error = io::Error::new(io::ErrorKind::PermissionDenied, "permission denied");
        assert!(!is_device_removed_error(&error));
    }

    #[test]
    fn test_entry_failure_kind_from_error() {
        let err = EngineError::FormatViolation {
            source_path: PathBuf::from("/dcim/IMG_0001.HEIC"),
            destination: PathBuf::from("/out/IMG_0001.jpg"),
        };
        let failure = EntryFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::FormatViolation);
        assert!(failure.message.contains("IMG_0001.jpg"));

        let err = EngineError::Integrity {
            path: PathBuf::from("/out/a.mov"),
            mismatch: IntegrityMismatch::Size {
                expected: 10,
                actual: 4,
            },
        };
        let failure = EntryFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::Integrity);
        assert!(failure.message.contains("expected 10"));
    }
}
