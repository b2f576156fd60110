//! In-memory collaborators for tests and embedders.
//!
//! Every store is a `std::sync::RwLock` around plain maps; no lock is held
//! across an await point.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::harmonize::InvalidRecord;
use crate::harvest::info::{HarvestInfo, InstanceSlot};
use crate::harvest::traits::{
    HarvestInfoStore, HarvestServices, InstanceToggle, InvalidRecordSink, ObservationSink,
    PrepareMode, SinkError,
};
use crate::model::{CanonicalObservation, ProviderId};

type Instance = BTreeMap<String, CanonicalObservation>;

/// Double-buffered observation store. Each provider has two instances; the
/// active one (primary until toggled) is what consumers read.
#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    instances: RwLock<HashMap<(ProviderId, InstanceSlot), Instance>>,
    active: RwLock<HashMap<ProviderId, InstanceSlot>>,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_slot(&self, provider_id: ProviderId) -> InstanceSlot {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider_id)
            .copied()
            .unwrap_or(InstanceSlot::Primary)
    }

    /// Records in one instance, ordered by occurrence id.
    pub fn observations(
        &self,
        provider_id: ProviderId,
        instance: InstanceSlot,
    ) -> Vec<CanonicalObservation> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(provider_id, instance))
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// What consumers currently see for a provider.
    pub fn active_observations(&self, provider_id: ProviderId) -> Vec<CanonicalObservation> {
        self.observations(provider_id, self.active_slot(provider_id))
    }
}

#[async_trait]
impl ObservationSink for MemoryObservationStore {
    async fn prepare_instance(
        &self,
        provider_id: ProviderId,
        instance: InstanceSlot,
        mode: PrepareMode,
    ) -> Result<(), SinkError> {
        let active = self.active_slot(provider_id);
        if mode == PrepareMode::CopyFromActive && instance == active {
            return Err(SinkError::Rejected(format!(
                "provider {provider_id}: cannot seed the active instance from itself"
            )));
        }

        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let seeded = match mode {
            PrepareMode::Keep => return Ok(()),
            PrepareMode::Empty => Instance::new(),
            PrepareMode::CopyFromActive => instances
                .get(&(provider_id, active))
                .cloned()
                .unwrap_or_default(),
        };
        instances.insert((provider_id, instance), seeded);
        Ok(())
    }

    async fn upsert(
        &self,
        provider_id: ProviderId,
        instance: InstanceSlot,
        batch: &[CanonicalObservation],
    ) -> Result<usize, SinkError> {
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let records = instances.entry((provider_id, instance)).or_default();
        for observation in batch {
            records.insert(observation.occurrence_id.clone(), observation.clone());
        }
        Ok(batch.len())
    }
}

#[async_trait]
impl InstanceToggle for MemoryObservationStore {
    async fn active_instance(&self, provider_id: ProviderId) -> Result<InstanceSlot, SinkError> {
        Ok(self.active_slot(provider_id))
    }

    async fn activate(
        &self,
        provider_id: ProviderId,
        instance: InstanceSlot,
    ) -> Result<(), SinkError> {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider_id, instance);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryInvalidRecordSink {
    records: RwLock<Vec<InvalidRecord>>,
}

impl MemoryInvalidRecordSink {
    pub fn records(&self) -> Vec<InvalidRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl InvalidRecordSink for MemoryInvalidRecordSink {
    async fn append(&self, records: &[InvalidRecord]) -> Result<(), SinkError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }
}

/// Keeps the latest info per provider plus every saved version.
#[derive(Debug, Default)]
pub struct MemoryHarvestInfoStore {
    latest: RwLock<HashMap<ProviderId, HarvestInfo>>,
    history: RwLock<Vec<HarvestInfo>>,
}

impl MemoryHarvestInfoStore {
    pub fn latest(&self, provider_id: ProviderId) -> Option<HarvestInfo> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider_id)
            .cloned()
    }

    pub fn history(&self) -> Vec<HarvestInfo> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HarvestInfoStore for MemoryHarvestInfoStore {
    async fn load(&self, provider_id: ProviderId) -> Result<Option<HarvestInfo>, SinkError> {
        Ok(self.latest(provider_id))
    }

    async fn save(&self, info: &HarvestInfo) -> Result<(), SinkError> {
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.provider_id, info.clone());
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info.clone());
        Ok(())
    }
}

/// All in-memory collaborators, wired together.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    pub observations: Arc<MemoryObservationStore>,
    pub invalid: Arc<MemoryInvalidRecordSink>,
    pub infos: Arc<MemoryHarvestInfoStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> HarvestServices {
        HarvestServices {
            sink: self.observations.clone(),
            invalid_sink: self.invalid.clone(),
            toggle: self.observations.clone(),
            info_store: self.infos.clone(),
        }
    }
}
