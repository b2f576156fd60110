//! Immutable reference data and its atomic replacement.
//!
//! Readers take an `Arc<ReferenceData>` and keep it for as long as they work
//! on a batch; a publish swaps the pointer and bumps the generation, never
//! touching data a reader may hold. Reads never take a lock.

use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::area::AreaIndex;
use crate::taxon::TaxonGraph;
use crate::vocabulary::VocabularyResolver;

/// One consistent set of reference data.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub generation: u64,
    pub taxa: Arc<TaxonGraph>,
    pub areas: Arc<AreaIndex>,
    pub vocabulary: Arc<VocabularyResolver>,
}

impl ReferenceData {
    pub fn new(taxa: TaxonGraph, areas: AreaIndex, vocabulary: VocabularyResolver) -> Self {
        Self {
            generation: 0,
            taxa: Arc::new(taxa),
            areas: Arc::new(areas),
            vocabulary: Arc::new(vocabulary),
        }
    }
}

#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: ArcSwap<ReferenceData>,
    /// Serializes publishers so generations are never skipped or repeated.
    publishing: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(initial: ReferenceData) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            publishing: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<ReferenceData> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current().generation
    }

    /// Replaces the whole snapshot. Returns the new generation.
    pub fn publish(&self, data: ReferenceData) -> u64 {
        self.swap(|_| data)
    }

    pub fn publish_taxa(&self, taxa: TaxonGraph) -> u64 {
        let taxa = Arc::new(taxa);
        self.swap(|old| ReferenceData {
            taxa,
            ..old.clone()
        })
    }

    pub fn publish_areas(&self, areas: AreaIndex) -> u64 {
        let areas = Arc::new(areas);
        self.swap(|old| ReferenceData {
            areas,
            ..old.clone()
        })
    }

    pub fn publish_vocabulary(&self, vocabulary: VocabularyResolver) -> u64 {
        let vocabulary = Arc::new(vocabulary);
        self.swap(|old| ReferenceData {
            vocabulary,
            ..old.clone()
        })
    }

    fn swap(&self, next: impl FnOnce(&ReferenceData) -> ReferenceData) -> u64 {
        let _publishing = self
            .publishing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let old = self.current.load_full();
        let mut data = next(&old);
        data.generation = old.generation + 1;
        let generation = data.generation;
        self.current.store(Arc::new(data));

        info!(generation, "Published reference snapshot");
        generation
    }
}
