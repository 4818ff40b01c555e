//! Destination layout: session folder naming, collision candidates and the
//! hidden paths used while writing.

use chrono::{DateTime, Local};
use regex::Regex;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::core::error::EngineError;
use crate::core::models::MediaKind;

pub const DEFAULT_DEVICE_NAME: &str = "iPhone";
pub const MAX_DEVICE_NAME_LEN: usize = 50;
pub const SIDECAR_EXTENSION: &str = "meta";
const TEMP_SUFFIX: &str = ".part";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w]").unwrap());
static UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").unwrap());

/// Turn a device display name into something safe for a folder name.
pub fn sanitize_device_name(name: &str) -> String {
    let unquoted: String = name
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '`' | '\u{2018}' | '\u{2019}' | '\u{201C}' | '\u{201D}'))
        .collect();
    let trimmed = unquoted.trim_matches(|c: char| c.is_whitespace() || c == '.');

    let spaced = WHITESPACE.replace_all(trimmed, "_");
    let words = NON_WORD.replace_all(&spaced, "");
    let collapsed = UNDERSCORES.replace_all(&words, "_");
    let collapsed = collapsed.trim_matches('_');

    let truncated: String = collapsed.chars().take(MAX_DEVICE_NAME_LEN).collect();
    if truncated.is_empty() {
        DEFAULT_DEVICE_NAME.to_string()
    } else {
        truncated
    }
}

/// `<SanitizedDeviceName>_<YYYYMMDD_HHMMSS>`
pub fn session_folder_name(device_name: &str, started: DateTime<Local>) -> String {
    format!(
        "{}_{}",
        sanitize_device_name(device_name),
        started.format("%Y%m%d_%H%M%S")
    )
}

/// Folder structure of one transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(destination_root: &Path, device_name: &str, started: DateTime<Local>) -> Self {
        Self {
            root: destination_root.join(session_folder_name(device_name, started)),
        }
    }

    /// Reuse an existing session folder.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_for(&self, kind: MediaKind) -> PathBuf {
        self.root.join(kind.folder_name())
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    pub fn create(&self) -> Result<(), EngineError> {
        for kind in [MediaKind::Photo, MediaKind::Video] {
            let folder = self.folder_for(kind);
            fs::create_dir_all(&folder).map_err(|e| EngineError::io(&folder, e))?;
        }
        Ok(())
    }
}

/// The `n`th collision candidate: `IMG_0001.HEIC`, `IMG_0001_1.HEIC`, ...
pub fn numbered_candidate(folder: &Path, filename: &str, n: usize) -> PathBuf {
    if n == 0 {
        return folder.join(filename);
    }
    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    match name.extension() {
        Some(ext) => folder.join(format!("{stem}_{n}.{}", ext.to_string_lossy())),
        None => folder.join(format!("{stem}_{n}")),
    }
}

/// Source and destination extensions must be byte-identical.
pub fn extensions_match(source: &Path, destination: &Path) -> bool {
    source.extension() == destination.extension()
}

/// `IMG_0001.HEIC` -> `IMG_0001.HEIC.meta`
pub fn sidecar_path(media: &Path) -> PathBuf {
    append_to_name(media, "", &format!(".{SIDECAR_EXTENSION}"))
}

/// `IMG_0001.HEIC` -> `.IMG_0001.HEIC.part`
pub fn temp_path(destination: &Path) -> PathBuf {
    append_to_name(destination, ".", TEMP_SUFFIX)
}

fn append_to_name(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix);
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(suffix);
    path.with_file_name(name)
}
