use serde::Serialize;
use std::path::{Path, PathBuf};

/// A device whose storage is browsable at `mount_point`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedDevice {
    pub label: String,
    pub mount_point: PathBuf,
}

impl MountedDevice {
    pub fn new(label: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            mount_point: mount_point.into(),
        }
    }

    /// Use the mount folder's own name as the label.
    pub fn from_mount_point(mount_point: impl Into<PathBuf>) -> Self {
        let mount_point = mount_point.into();
        let label = mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { label, mount_point }
    }

    pub fn root(&self) -> &Path {
        &self.mount_point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_from_mount_point() {
        let device = MountedDevice::from_mount_point("/run/user/1000/gvfs/Anas iPhone");
        assert_eq!(device.label, "Anas iPhone");
        assert_eq!(device.root(), Path::new("/run/user/1000/gvfs/Anas iPhone"));
    }
}
