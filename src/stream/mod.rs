//! Device data-stream layer: the per-device append-only log and the scan
//! loop that feeds the intent router from it.

pub mod scan;
pub mod store;

pub use scan::ScanLoop;
pub use store::{
    FilePayloadStore, MemoryPayloadStore, PayloadRef, PayloadStore, StreamEntry, StreamStore,
};
