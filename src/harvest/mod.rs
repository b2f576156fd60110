//! Harvest module - incremental, double-buffered provider harvests.
//!
//! - **Cursor**: forward-only [`Watermark`] tracking via [`HarvestCursor`]
//! - **Info**: per-run bookkeeping and resume planning ([`HarvestInfo`], [`RunStart`])
//! - **Traits**: sink, toggle and info-store seams
//! - **Runner**: the batch loop via [`runner::HarvestRunner`]
//! - **Memory**: in-memory collaborators

pub mod cursor;
pub mod info;
pub mod memory;
pub mod runner;
pub mod traits;

// Re-export commonly used types
pub use cursor::{HarvestCursor, Watermark, WatermarkKindMismatch};
pub use info::{HarvestInfo, HarvestMode, HarvestStatus, InstanceSlot, PreviousRun, RunStart};
pub use runner::{HarvestError, HarvestJob, HarvestRunner};
pub use traits::{
    HarvestInfoStore, HarvestServices, InstanceToggle, InvalidRecordSink, ObservationSink,
    PrepareMode, SinkError,
};
