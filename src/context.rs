use anyhow::Result;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::models::{KindFilter, RangeFilter};
use crate::core::scanner::Scanner;
use crate::core::transfer_engine::TransferEngine;
use crate::core::verifier::Verifier;
use crate::db::{self, HistoryStore};

/// Everything a scan or transfer needs, built once per process.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub history: HistoryStore,
    pub verifier: Verifier,
}

impl AppContext {
    /// Open the history database named by the config.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let conn = db::init(&config.history_path).await?;
        Self::with_history(config, HistoryStore::open(conn).await?)
    }

    pub fn with_history(config: AppConfig, history: HistoryStore) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            history,
            verifier: Verifier::new(),
        })
    }

    pub fn scanner(&self, kind_filter: KindFilter, range: Option<RangeFilter>) -> Scanner {
        Scanner::new(
            self.config.scan_options(kind_filter, range),
            self.config.video_probe(),
            self.verifier.clone(),
        )
    }

    pub fn transfer_engine(&self) -> TransferEngine {
        TransferEngine::new(
            self.config.transfer_options(),
            self.history.clone(),
            self.verifier.clone(),
        )
    }
}
