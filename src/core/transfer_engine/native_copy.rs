use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, error};

use crate::core::error::EngineError;
use crate::core::layout::{extensions_match, temp_path};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Copy one file into place.
///
/// Data is streamed into a hidden temporary file in the destination folder,
/// optionally fsynced, stamped with the source's access and modification
/// times, then renamed over `dest`. The temporary file is removed on any
/// failure, so `dest` either holds a complete copy or is untouched.
///
/// The destination must keep the source's extension byte for byte; anything
/// else is refused as a format violation.
pub fn copy_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64, EngineError> {
    if !extensions_match(source, dest) {
        error!(
            source = %source.display(),
            dest = %dest.display(),
            "Refusing to copy: destination extension differs from source"
        );
        return Err(EngineError::FormatViolation {
            source_path: source.to_path_buf(),
            destination: dest.to_path_buf(),
        });
    }

    let tmp = temp_path(dest);
    match write_temp(source, &tmp, sync_file) {
        Ok(bytes_written) => {
            fs::rename(&tmp, dest).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                EngineError::io(dest, e)
            })?;
            Ok(bytes_written)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_temp(source: &Path, tmp: &Path, sync_file: bool) -> Result<u64, EngineError> {
    let source_metadata = fs::metadata(source).map_err(|e| EngineError::io(source, e))?;

    let source_file = File::open(source).map_err(|e| EngineError::io(source, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = File::create(tmp).map_err(|e| EngineError::io(tmp, e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| EngineError::io(source, e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| EngineError::io(tmp, e))?;
        bytes_written += bytes_read as u64;
    }

    writer.flush().map_err(|e| EngineError::io(tmp, e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| EngineError::io(tmp, e.into_error()))?;
        inner.sync_all().map_err(|e| EngineError::io(tmp, e))?;
    } else {
        drop(writer);
    }

    // Preserve timestamps
    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_times(tmp, atime, mtime) {
        debug!(
            dest = %tmp.display(),
            error = %e,
            "Failed to preserve file timestamps"
        );
    }

    Ok(bytes_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_preserves_content_and_mtime() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("IMG_0001.HEIC");
        let dest = temp.path().join("out/IMG_0001.HEIC");
        fs::create_dir(temp.path().join("out")).unwrap();

        let content = vec![42u8; BUFFER_SIZE * 2 + 17];
        fs::write(&source, &content).unwrap();
        let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&source, mtime).unwrap();

        let bytes = copy_file(&source, &dest, true).unwrap();
        assert_eq!(bytes, content.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), content);

        let dest_meta = fs::metadata(&dest).unwrap();
        assert_eq!(filetime::FileTime::from_last_modification_time(&dest_meta), mtime);
        assert!(!temp.path().join("out/.IMG_0001.HEIC.part").exists());
    }

    #[test]
    fn test_copy_empty_file() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("empty.jpg");
        let dest = temp.path().join("copy/empty.jpg");
        fs::create_dir(temp.path().join("copy")).unwrap();
        fs::write(&source, b"").unwrap();

        assert_eq!(copy_file(&source, &dest, false).unwrap(), 0);
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
    }

    #[test]
    fn test_heic_is_never_written_as_jpg() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("IMG_0001.heic");
        let dest = temp.path().join("IMG_0001.jpg");
        fs::write(&source, b"heic bytes").unwrap();

        let err = copy_file(&source, &dest, false).unwrap_err();
        assert!(matches!(err, EngineError::FormatViolation { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_missing_source_leaves_no_temp_file() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("gone.mov");
        let dest = temp.path().join("out.mov");

        let err = copy_file(&source, &dest, false).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
        assert!(err.is_device_removed());
        assert!(!dest.exists());
        assert!(!temp.path().join(".out.mov.part").exists());
    }
}
