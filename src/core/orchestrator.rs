use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::context::AppContext;
use crate::core::device::MountedDevice;
use crate::core::error::TransferAborted;
use crate::core::layout::SessionLayout;
use crate::core::models::{InventorySummary, KindFilter, RangeFilter, TransferResult};
use crate::core::scanner::ScanTick;
use crate::core::transfer_engine::TransferStatus;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub destination_root: PathBuf,
    pub kind: KindFilter,
    pub range: Option<RangeFilter>,
    /// Continue into an existing session folder instead of starting a new one.
    pub session: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IngestEvent {
    Scan(ScanTick),
    Scanned(InventorySummary),
    Transfer(TransferStatus),
}

/// Runs scan-then-transfer for one device.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn ingest(
        &self,
        device: &MountedDevice,
        request: IngestRequest,
        events: mpsc::Sender<IngestEvent>,
        cancel: CancellationToken,
    ) -> Result<TransferResult, TransferAborted> {
        let span = info_span!("ingest", device = %device.label);

        async {
            let layout = match &request.session {
                Some(session) => SessionLayout::at(session),
                None => SessionLayout::new(&request.destination_root, &device.label, Local::now()),
            };

            let scanner = self.ctx.scanner(request.kind, request.range);
            let (scan_tx, scan_rx) = mpsc::channel(EVENT_BUFFER);
            let forwarder = forward(scan_rx, events.clone(), IngestEvent::Scan);
            let scanned = scanner.scan(device.root(), scan_tx, cancel.clone()).await;
            let _ = forwarder.await;

            let inventory = match scanned {
                Ok(inventory) => inventory,
                Err(error) => {
                    error!(error = %error, "Scan failed");
                    let _ = events.try_send(IngestEvent::Transfer(TransferStatus::Failed(
                        error.to_string(),
                    )));
                    return Err(TransferAborted {
                        error,
                        partial: TransferResult::new(layout.root()),
                    });
                }
            };

            if let Some(partial) = inventory.partial() {
                info!(%partial, "Transferring partial inventory");
            }
            let _ = events.try_send(IngestEvent::Scanned(inventory.summary()));

            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let forwarder = forward(rx, events, IngestEvent::Transfer);
            let result = self
                .ctx
                .transfer_engine()
                .transfer(&inventory, &layout, tx, cancel)
                .await;
            let _ = forwarder.await;

            result
        }
        .instrument(span)
        .await
    }
}

/// Relay one progress stream into the ingest event stream, dropping events
/// the caller is too slow to take.
fn forward<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    events: mpsc::Sender<IngestEvent>,
    wrap: fn(T) -> IngestEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Err(mpsc::error::TrySendError::Closed(_)) = events.try_send(wrap(item)) {
                break;
            }
        }
    })
}
