//! Best-effort metadata extraction. Nothing here fails: missing or broken
//! metadata yields partially-populated structs.

use exif::{Exif, In, Tag, Value};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::core::models::{PhotoMetadata, VideoMetadata};

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Read EXIF from a photo container (JPEG, TIFF, HEIF, PNG).
pub fn extract_photo(path: &Path) -> PhotoMetadata {
    let mut metadata = match read_exif(path) {
        Ok(exif) => photo_from_exif(&exif),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No EXIF data");
            PhotoMetadata::default()
        }
    };

    if metadata.dimensions.is_none() {
        metadata.dimensions = png_dimensions(path);
    }
    metadata
}

fn read_exif(path: &Path) -> Result<Exif, exif::Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    exif::Reader::new().read_from_container(&mut reader)
}

fn photo_from_exif(exif: &Exif) -> PhotoMetadata {
    let text = |tag: Tag| exif.get_field(tag, In::PRIMARY).and_then(|f| ascii(&f.value));
    let uint = |tag: Tag| {
        exif.get_field(tag, In::PRIMARY)
            .and_then(|f| f.value.get_uint(0))
    };

    let dimensions = match (uint(Tag::PixelXDimension), uint(Tag::PixelYDimension)) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => match (uint(Tag::ImageWidth), uint(Tag::ImageLength)) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        },
    };

    let exif_data = exif
        .fields()
        .filter(|f| f.ifd_num == In::PRIMARY)
        .map(|f| {
            let value = ascii(&f.value)
                .unwrap_or_else(|| f.display_value().with_unit(exif).to_string());
            (f.tag.to_string(), value)
        })
        .collect();

    PhotoMetadata {
        camera_make: text(Tag::Make),
        camera_model: text(Tag::Model),
        dimensions,
        orientation: uint(Tag::Orientation),
        creation_date: text(Tag::DateTimeOriginal)
            .or_else(|| text(Tag::DateTime))
            .or_else(|| text(Tag::DateTimeDigitized)),
        exif_data,
    }
}

/// First ASCII component, without the quoting `display_value` adds.
fn ascii(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts.first().map(|bytes| {
            String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }),
        _ => None,
    }
}

/// Width and height from a PNG IHDR chunk.
fn png_dimensions(path: &Path) -> Option<(u32, u32)> {
    let mut header = [0u8; 24];
    File::open(path).ok()?.read_exact(&mut header).ok()?;
    if &header[..8] != PNG_SIGNATURE || &header[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(header[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(header[20..24].try_into().ok()?);
    Some((width, height))
}

/// Runs `ffprobe` against video files.
#[derive(Debug, Clone)]
pub struct VideoProbe {
    program: PathBuf,
}

impl Default for VideoProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl VideoProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn probe(&self, path: &Path) -> VideoMetadata {
        let output = Command::new(&self.program)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output();

        match output {
            Ok(output) if output.status.success() => {
                parse_probe_output(&String::from_utf8_lossy(&output.stdout)).unwrap_or_default()
            }
            Ok(output) => {
                debug!(path = %path.display(), status = %output.status, "ffprobe failed");
                VideoMetadata::default()
            }
            Err(e) => {
                debug!(program = %self.program.display(), error = %e, "ffprobe unavailable");
                VideoMetadata::default()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -print_format json` output.
pub fn parse_probe_output(json: &str) -> Option<VideoMetadata> {
    let probe: ProbeOutput = serde_json::from_str(json).ok()?;

    let mut metadata = VideoMetadata {
        duration_secs: probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok()),
        ..Default::default()
    };

    if let Some(stream) = probe
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
    {
        metadata.codec = stream.codec_name;
        metadata.resolution = match (stream.width, stream.height) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        };
        metadata.frame_rate = stream.r_frame_rate.as_deref().and_then(parse_frame_rate);
    }

    Some(metadata)
}

/// `30000/1001` -> 29.97
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 { None } else { Some(num / den) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "hevc", "width": 1920, "height": 1080,
                 "r_frame_rate": "30000/1001"}
            ],
            "format": {"duration": "12.500000"}
        }"#;

        let metadata = parse_probe_output(json).unwrap();
        assert_eq!(metadata.codec.as_deref(), Some("hevc"));
        assert_eq!(metadata.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(metadata.duration_secs, Some(12.5));
        let fps = metadata.frame_rate.unwrap();
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_probe_output_without_video_stream() {
        let metadata = parse_probe_output(r#"{"streams": [], "format": {}}"#).unwrap();
        assert_eq!(metadata, VideoMetadata::default());
        assert!(parse_probe_output("not json").is_none());
    }

    #[test]
    fn test_parse_frame_rate_zero_denominator() {
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
    }

    #[test]
    fn test_missing_ffprobe_yields_empty_metadata() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("clip.mov");
        std::fs::write(&path, b"not a movie").unwrap();

        let probe = VideoProbe::new(temp.path().join("no-such-ffprobe"));
        assert_eq!(probe.probe(&path), VideoMetadata::default());
    }

    #[test]
    fn test_photo_without_exif_is_empty() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("IMG_0001.JPG");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        assert_eq!(extract_photo(&path), PhotoMetadata::default());
    }

    #[test]
    fn test_png_dimensions_from_ihdr() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("shot.png");
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&640u32.to_be_bytes());
        bytes.extend_from_slice(&480u32.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(extract_photo(&path).dimensions, Some((640, 480)));
    }
}
