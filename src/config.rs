use anyhow::{Context, Result, bail};
use directories::{ProjectDirs, UserDirs};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::metadata::VideoProbe;
use crate::core::models::{KindFilter, RangeFilter};
use crate::core::scanner::ScanOptions;
use crate::core::transfer_engine::{MAX_BATCH_SIZE, TransferOptions};

const APP_NAME: &str = "dcimsync";
const ENV_PREFIX: &str = "DCIMSYNC_";
const MEDIA_FOLDER: &str = "iPhone_Media";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Parent folder for session folders.
    pub destination_directory: PathBuf,
    pub history_path: PathBuf,
    pub transfer_batch_size: usize,
    pub scan_batch_size: usize,
    pub scan_batch_pause_ms: u64,
    pub hash_during_scan: bool,
    pub write_sidecars: bool,
    pub sync_files: bool,
    pub ffprobe_path: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            destination_directory: default_destination(),
            history_path: default_history_path(),
            transfer_batch_size: 10,
            scan_batch_size: 20,
            scan_batch_pause_ms: 50,
            hash_during_scan: true,
            write_sidecars: true,
            sync_files: true,
            ffprobe_path: PathBuf::from("ffprobe"),
            verbose: false,
            json_logs: false,
            log_file: None,
        }
    }
}

impl AppConfig {
    /// Load from the per-user config file, environment and CLI overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load_from(&config_file_path(), overrides)
    }

    /// Defaults, then the TOML file at `path` (if present), then
    /// `DCIMSYNC_*` variables, then `overrides`.
    pub fn load_from<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("transfer_batch_size", self.transfer_batch_size),
            ("scan_batch_size", self.scan_batch_size),
        ] {
            if !(1..=MAX_BATCH_SIZE).contains(&value) {
                bail!("{name} must be between 1 and {MAX_BATCH_SIZE}, got {value}");
            }
        }
        if self.ffprobe_path.as_os_str().is_empty() {
            bail!("ffprobe_path must not be empty");
        }
        Ok(())
    }

    pub fn scan_options(&self, kind_filter: KindFilter, range: Option<RangeFilter>) -> ScanOptions {
        ScanOptions {
            kind_filter,
            range,
            batch_size: self.scan_batch_size,
            batch_pause: Duration::from_millis(self.scan_batch_pause_ms),
            compute_hashes: self.hash_during_scan,
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            batch_size: self.transfer_batch_size,
            write_sidecars: self.write_sidecars,
            sync_files: self.sync_files,
        }
    }

    pub fn video_probe(&self) -> VideoProbe {
        VideoProbe::new(&self.ffprobe_path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// `<config_dir>/config.toml`
pub fn config_file_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn default_history_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("history.db"))
        .unwrap_or_else(|| PathBuf::from("history.db"))
}

fn default_destination() -> PathBuf {
    match UserDirs::new() {
        Some(dirs) => dirs
            .picture_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.home_dir().join("Pictures"))
            .join(MEDIA_FOLDER),
        None => PathBuf::from(MEDIA_FOLDER),
    }
}
