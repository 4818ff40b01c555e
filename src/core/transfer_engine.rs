//! Idempotent, verified transfer of an [`Inventory`] into a session folder.
//!
//! Entries are processed in fixed-size batches on a blocking worker. Between
//! batches the engine checks for cancellation and for the source root having
//! disappeared, and flushes the history store so that every confirmed copy
//! from a finished batch survives a crash.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::error::{EngineError, EntryFailure, TransferAborted};
use crate::core::layout::{SessionLayout, extensions_match, numbered_candidate};
use crate::core::models::{
    ContentHash, EntryOutcome, EntryState, EntryWarning, Inventory, MediaEntry, TransferCounts,
    TransferResult,
};
use crate::core::sidecar::Sidecar;
use crate::core::verifier::Verifier;
use crate::db::{HistoryRecord, HistoryStore, RunLogEntry, SourceIdentity};
use crate::logging::LogThrottle;

pub mod native_copy;

pub use native_copy::copy_file;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 100;

/// Progress reported while a transfer runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TransferStatus {
    Ready {
        total: usize,
        destination: PathBuf,
    },
    InProgress {
        percentage: u8,
        message: String,
        processed: usize,
        total: usize,
    },
    BatchComplete {
        batch: usize,
        processed: usize,
        total: usize,
    },
    Complete(TransferCounts),
    Cancelled {
        processed: usize,
        total: usize,
    },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub batch_size: usize,
    pub write_sidecars: bool,
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            write_sidecars: true,
            sync_files: true,
        }
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    options: TransferOptions,
    history: HistoryStore,
    verifier: Verifier,
}

impl TransferEngine {
    pub fn new(options: TransferOptions, history: HistoryStore, verifier: Verifier) -> Self {
        Self {
            options,
            history,
            verifier,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Copy every entry of `inventory` into `layout`.
    ///
    /// Per-entry failures are recorded in the result. Only catastrophic
    /// conditions end the run early, as a [`TransferAborted`] carrying the
    /// partial result. Cancellation is not an error: the result comes back
    /// with `cancelled` set.
    pub async fn transfer(
        &self,
        inventory: &Inventory,
        layout: &SessionLayout,
        tx: mpsc::Sender<TransferStatus>,
        cancel: CancellationToken,
    ) -> Result<TransferResult, TransferAborted> {
        let span = info_span!(
            "transfer",
            source = %inventory.root().display(),
            destination = %layout.root().display()
        );

        self.run(inventory, layout, tx, cancel).instrument(span).await
    }

    async fn run(
        &self,
        inventory: &Inventory,
        layout: &SessionLayout,
        tx: mpsc::Sender<TransferStatus>,
        cancel: CancellationToken,
    ) -> Result<TransferResult, TransferAborted> {
        let started = Instant::now();
        let total = inventory.len();
        let mut result = TransferResult::new(layout.root());

        if cancel.is_cancelled() {
            info!(total, "Transfer cancelled before start");
            result.cancelled = true;
            let _ = tx.try_send(TransferStatus::Cancelled { processed: 0, total });
            return Ok(result);
        }

        if let Err(e) = layout.create() {
            error!(error = %e, "Failed to create session folder");
            return Err(self.abort(e, result, &tx).await);
        }

        info!(total, "Starting transfer");
        let _ = tx.try_send(TransferStatus::Ready {
            total,
            destination: layout.root().to_path_buf(),
        });

        let batch_size = self.options.batch_size.clamp(1, MAX_BATCH_SIZE);
        for (batch_index, batch) in inventory.entries().chunks(batch_size).enumerate() {
            let processed = result.outcomes.len();

            if cancel.is_cancelled() {
                info!(processed, total, "Transfer cancelled");
                result.cancelled = true;
                let _ = tx.try_send(TransferStatus::Cancelled { processed, total });
                break;
            }

            if !inventory.root().exists() {
                let e = EngineError::DeviceRemoved {
                    path: inventory.root().to_path_buf(),
                };
                error!(processed, total, "Source disappeared during transfer");
                return Err(self.abort(e, result, &tx).await);
            }

            let worker = BatchWorker {
                engine: self.clone(),
                layout: layout.clone(),
                source_root: inventory.root().to_path_buf(),
                tx: tx.clone(),
                processed,
                total,
            };
            let batch = batch.to_vec();

            let (outcomes, fatal) = match tokio::task::spawn_blocking(move || worker.run(batch)).await {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Transfer worker failed");
                    return Err(self.abort(EngineError::Worker(e.to_string()), result, &tx).await);
                }
            };
            for outcome in outcomes {
                result.push(outcome);
            }

            if let Err(e) = self.history.flush().await {
                error!(error = %e, "Failed to persist transfer history");
                return Err(self.abort(e, result, &tx).await);
            }

            if let Some(e) = fatal {
                error!(error = %e, "Source disappeared during transfer");
                return Err(self.abort(e, result, &tx).await);
            }

            debug!(batch = batch_index + 1, processed = result.outcomes.len(), total, "Batch complete");
            let _ = tx.try_send(TransferStatus::BatchComplete {
                batch: batch_index + 1,
                processed: result.outcomes.len(),
                total,
            });
        }

        self.log_run(&result).await;

        let counts = result.counts;
        info!(
            success = counts.success,
            failed = counts.failed,
            skipped = counts.skipped,
            warned = counts.warned,
            total = counts.total(),
            corrupted = result.corrupted(),
            cancelled = result.cancelled,
            duration_secs = started.elapsed().as_secs(),
            destination = %result.destination.display(),
            "Transfer finished"
        );

        if !result.cancelled {
            let _ = tx.try_send(TransferStatus::Complete(counts));
        }
        Ok(result)
    }

    async fn abort(
        &self,
        error: EngineError,
        partial: TransferResult,
        tx: &mpsc::Sender<TransferStatus>,
    ) -> TransferAborted {
        if let Err(e) = self.history.flush().await {
            warn!(error = %e, pending = self.history.pending(), "History flush failed while aborting");
        }
        self.log_run(&partial).await;

        let _ = tx.try_send(TransferStatus::Failed(error.to_string()));
        TransferAborted { error, partial }
    }

    async fn log_run(&self, result: &TransferResult) {
        let entry = RunLogEntry::new(&result.destination, result.counts);
        if let Err(e) = self.history.record_run(&entry).await {
            warn!(error = %e, "Failed to record transfer run");
        }
    }
}

/// Processes one batch on a blocking thread.
struct BatchWorker {
    engine: TransferEngine,
    layout: SessionLayout,
    source_root: PathBuf,
    tx: mpsc::Sender<TransferStatus>,
    processed: usize,
    total: usize,
}

enum Candidate {
    Free(PathBuf),
    Identical(PathBuf),
}

impl BatchWorker {
    fn run(self, batch: Vec<MediaEntry>) -> (Vec<EntryOutcome>, Option<EngineError>) {
        let throttle = LogThrottle::new(std::time::Duration::from_millis(500));
        let mut outcomes = Vec::with_capacity(batch.len());

        for entry in batch {
            let outcome = self.process(entry);
            let failed = outcome.state == EntryState::Failed;
            self.report(&outcome, outcomes.len(), &throttle);
            outcomes.push(outcome);

            if failed && !self.source_root.exists() {
                return (
                    outcomes,
                    Some(EngineError::DeviceRemoved {
                        path: self.source_root.clone(),
                    }),
                );
            }
        }
        (outcomes, None)
    }

    fn report(&self, outcome: &EntryOutcome, index: usize, throttle: &LogThrottle) {
        let processed = self.processed + index + 1;
        let percentage = if self.total > 0 {
            ((processed * 100) / self.total).min(100) as u8
        } else {
            100
        };
        let verb = match outcome.state {
            EntryState::Done => "Copied",
            EntryState::Warned => "Copied (empty)",
            EntryState::Skipped => "Skipped",
            EntryState::FailedCorrupt => "Corrupted",
            _ => "Failed",
        };
        let message = format!("{verb} {}", outcome.entry.filename);

        if throttle.should_log() {
            debug!(processed, total = self.total, percentage, "Transfer progress");
        }
        let _ = self.tx.try_send(TransferStatus::InProgress {
            percentage,
            message,
            processed,
            total: self.total,
        });
    }

    fn process(&self, entry: MediaEntry) -> EntryOutcome {
        let verifier = &self.engine.verifier;
        let history = &self.engine.history;

        let digest = verifier.source_hash(&entry);
        let identity = SourceIdentity::for_entry(&entry, digest.as_ref());

        let mut target = None;
        if let Some(record) = history.get(&identity) {
            let recorded = record.destination_path;
            match verifier.matches(&recorded, digest.as_ref(), entry.size_bytes) {
                Ok(()) => {
                    debug!(file = %entry.filename, dest = %recorded.display(), "Already transferred");
                    return outcome(entry, EntryState::Skipped, Some(recorded), digest);
                }
                Err(mismatch)
                    if self.layout.contains(&recorded)
                        && extensions_match(&entry.source_path, &recorded) =>
                {
                    info!(dest = %recorded.display(), %mismatch, "Recopying stale destination");
                    if let Err(e) = fs::remove_file(&recorded) {
                        warn!(dest = %recorded.display(), error = %e, "Failed to remove stale copy");
                    }
                    target = Some(recorded);
                }
                Err(_) => {}
            }
        }

        let dest = match target {
            Some(dest) => dest,
            None => match self.resolve_candidate(&entry, digest.as_ref()) {
                Candidate::Free(dest) => dest,
                Candidate::Identical(dest) => {
                    debug!(file = %entry.filename, dest = %dest.display(), "Identical file already present");
                    history.put(&identity, HistoryRecord::now(&dest));
                    return outcome(entry, EntryState::Skipped, Some(dest), digest);
                }
            },
        };

        debug!(file = %entry.filename, dest = %dest.display(), "Copying");
        if let Err(e) = copy_file(&entry.source_path, &dest, self.engine.options.sync_files) {
            if !matches!(e, EngineError::FormatViolation { .. }) {
                warn!(file = %entry.filename, error = %e, "Copy failed");
            }
            let mut failed = outcome(entry, EntryState::Failed, None, digest);
            failed.error = Some(EntryFailure::from(&e));
            return failed;
        }

        debug!(file = %entry.filename, "Verifying");
        if let Err(mismatch) = verifier.matches(&dest, digest.as_ref(), entry.size_bytes) {
            error!(file = %entry.filename, dest = %dest.display(), %mismatch, "Verification failed, removing copy");
            if let Err(e) = fs::remove_file(&dest) {
                warn!(dest = %dest.display(), error = %e, "Failed to remove corrupt copy");
            }
            let e = EngineError::Integrity {
                path: dest,
                mismatch,
            };
            let mut corrupt = outcome(entry, EntryState::FailedCorrupt, None, digest);
            corrupt.error = Some(EntryFailure::from(&e));
            return corrupt;
        }

        if self.engine.options.write_sidecars {
            if let Err(e) = Sidecar::from_entry(&entry, digest.as_ref()).write_beside(&dest) {
                warn!(dest = %dest.display(), error = %e, "Failed to write sidecar");
            }
        }

        history.put(&identity, HistoryRecord::now(&dest));

        if entry.size_bytes == 0 {
            warn!(file = %entry.filename, "Source file is empty");
            let mut warned = outcome(entry, EntryState::Warned, Some(dest), digest);
            warned.warning = Some(EntryWarning::EmptySource);
            return warned;
        }
        outcome(entry, EntryState::Done, Some(dest), digest)
    }

    /// First free name in the kind folder, unless an identical copy is found on the way.
    fn resolve_candidate(&self, entry: &MediaEntry, digest: Option<&ContentHash>) -> Candidate {
        let folder = self.layout.folder_for(entry.kind());
        let mut n = 0;
        loop {
            let candidate = numbered_candidate(&folder, &entry.filename, n);
            if !exists(&candidate) {
                return Candidate::Free(candidate);
            }
            if digest.is_some()
                && self
                    .engine
                    .verifier
                    .matches(&candidate, digest, entry.size_bytes)
                    .is_ok()
            {
                return Candidate::Identical(candidate);
            }
            n += 1;
        }
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn outcome(
    entry: MediaEntry,
    state: EntryState,
    destination: Option<PathBuf>,
    digest: Option<ContentHash>,
) -> EntryOutcome {
    EntryOutcome {
        entry,
        state,
        destination,
        digest,
        error: None,
        warning: None,
    }
}
