pub mod device;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod scanner;
pub mod sidecar;
pub mod transfer_engine;
pub mod verifier;

pub use device::MountedDevice;
pub use error::{EngineError, PartialScan, TransferAborted};
pub use layout::{SessionLayout, sanitize_device_name};
pub use models::{
    ContentHash, EntryState, Inventory, KindFilter, MediaEntry, MediaKind, RangeFilter,
    TransferCounts, TransferResult,
};
pub use orchestrator::{IngestEvent, IngestRequest, Orchestrator};
pub use scanner::{MediaCount, ScanOptions, ScanTick, Scanner};
pub use transfer_engine::{TransferEngine, TransferOptions, TransferStatus};
pub use verifier::{AuditReport, Verifier, audit_session};
