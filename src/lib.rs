//! Harvests biodiversity observations from heterogeneous providers and
//! harmonizes them into one privacy-aware canonical record.
//!
//! Reference data ([`taxon::TaxonGraph`], [`area::AreaIndex`],
//! [`vocabulary::VocabularyResolver`]) is published as immutable snapshots
//! through [`snapshot::SnapshotStore`]. [`harvest::HarvestRunner`] drives one
//! provider's connector, [`executor::HarvestExecutor`] runs many in parallel.

pub mod area;
pub mod config;
pub mod executor;
pub mod geometry;
pub mod harmonize;
pub mod harvest;
pub mod logging;
pub mod mapping;
pub mod model;
pub mod sensitivity;
pub mod snapshot;
pub mod taxon;
pub mod traits;
pub mod vocabulary;

// Re-export common types for convenience
pub use executor::*;
pub use model::*;
pub use traits::*;
