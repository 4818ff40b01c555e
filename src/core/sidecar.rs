use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::layout::{sidecar_path, temp_path};
use crate::core::models::{ContentHash, MediaEntry, MediaKind, MediaMetadata};

/// JSON record written beside every transferred file as `<filename>.meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub original_path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub ctime: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Empty when the source could not be hashed.
    pub hash: String,
    pub transfer_date: DateTime<Utc>,
    #[serde(default)]
    pub exif_data: BTreeMap<String, String>,
    pub creation_date: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub dimensions: Option<(u32, u32)>,
    pub orientation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
}

impl Sidecar {
    pub fn from_entry(entry: &MediaEntry, digest: Option<&ContentHash>) -> Self {
        let mut sidecar = Self {
            original_path: entry.source_path.clone(),
            filename: entry.filename.clone(),
            size: entry.size_bytes,
            mtime: entry.modified,
            ctime: entry.created,
            kind: entry.kind(),
            hash: digest.map(|d| d.to_string()).unwrap_or_default(),
            transfer_date: Utc::now(),
            exif_data: BTreeMap::new(),
            creation_date: None,
            camera_make: None,
            camera_model: None,
            dimensions: None,
            orientation: None,
            duration: None,
            resolution: None,
            codec: None,
            frame_rate: None,
        };

        match &entry.metadata {
            MediaMetadata::Photo(photo) => {
                sidecar.exif_data = photo.exif_data.clone();
                sidecar.creation_date = photo.creation_date.clone();
                sidecar.camera_make = photo.camera_make.clone();
                sidecar.camera_model = photo.camera_model.clone();
                sidecar.dimensions = photo.dimensions;
                sidecar.orientation = photo.orientation;
            }
            MediaMetadata::Video(video) => {
                sidecar.duration = video.duration_secs;
                sidecar.resolution = video.resolution.clone();
                sidecar.codec = video.codec.clone();
                sidecar.frame_rate = video.frame_rate;
            }
        }
        sidecar
    }

    pub fn content_hash(&self) -> Option<ContentHash> {
        if self.hash.is_empty() {
            None
        } else {
            Some(ContentHash::from_hex(self.hash.clone()))
        }
    }

    /// Write the sidecar next to `media`, replacing any previous one atomically.
    pub fn write_beside(&self, media: &Path) -> Result<PathBuf> {
        let path = sidecar_path(media);
        let tmp = temp_path(&path);

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize sidecar")?;
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to write sidecar {}", path.display()));
        }
        Ok(path)
    }

    pub fn read_for(media: &Path) -> Result<Self> {
        let path = sidecar_path(media);
        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Invalid sidecar {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{PhotoMetadata, VideoMetadata};
    use tempfile::tempdir;

    fn entry(metadata: MediaMetadata) -> MediaEntry {
        MediaEntry {
            source_path: PathBuf::from("/mnt/DCIM/100APPLE/IMG_0001.MOV"),
            relative_path: PathBuf::from("DCIM/100APPLE/IMG_0001.MOV"),
            filename: "IMG_0001.MOV".to_string(),
            size_bytes: 42,
            modified: Utc::now(),
            created: None,
            content_hash: None,
            metadata,
        }
    }

    #[test]
    fn test_video_sidecar_fields() {
        let video = VideoMetadata {
            duration_secs: Some(3.5),
            resolution: Some("1920x1080".into()),
            codec: Some("hevc".into()),
            frame_rate: Some(30.0),
        };
        let digest = ContentHash::from_hash(blake3::hash(b"x"));
        let sidecar = Sidecar::from_entry(&entry(MediaMetadata::Video(video)), Some(&digest));

        let json: serde_json::Value = serde_json::to_value(&sidecar).unwrap();
        assert_eq!(json["type"], "video");
        assert_eq!(json["hash"], digest.to_string());
        assert_eq!(json["codec"], "hevc");
        assert_eq!(json["duration"], 3.5);
        assert_eq!(json["original_path"], "/mnt/DCIM/100APPLE/IMG_0001.MOV");
        assert!(json["camera_make"].is_null());
    }

    #[test]
    fn test_photo_sidecar_omits_video_fields() {
        let photo = PhotoMetadata {
            camera_make: Some("Apple".into()),
            orientation: Some(6),
            ..Default::default()
        };
        let sidecar = Sidecar::from_entry(&entry(MediaMetadata::Photo(photo)), None);

        let json: serde_json::Value = serde_json::to_value(&sidecar).unwrap();
        assert_eq!(json["type"], "photo");
        assert_eq!(json["hash"], "");
        assert_eq!(json["camera_make"], "Apple");
        assert_eq!(json["orientation"], 6);
        assert!(json.get("codec").is_none());
        assert!(sidecar.content_hash().is_none());
    }

    #[test]
    fn test_write_and_read_back() {
        let temp = tempdir().unwrap();
        let media = temp.path().join("IMG_0001.MOV");
        fs::write(&media, b"movie").unwrap();

        let sidecar = Sidecar::from_entry(&entry(MediaMetadata::Video(VideoMetadata::default())), None);
        let written = sidecar.write_beside(&media).unwrap();

        assert_eq!(written, temp.path().join("IMG_0001.MOV.meta"));
        assert!(!temp.path().join(".IMG_0001.MOV.meta.part").exists());
        assert_eq!(Sidecar::read_for(&media).unwrap(), sidecar);
    }
}
