//! Collaborator seams of the harvest loop.
//!
//! The runner never owns storage. It writes canonical records to an
//! [`ObservationSink`], rejected records to an [`InvalidRecordSink`], flips
//! the active instance through an [`InstanceToggle`] and persists progress in
//! a [`HarvestInfoStore`]. In-memory implementations live in
//! [`crate::harvest::memory`].

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::harmonize::InvalidRecord;
use crate::harvest::info::{HarvestInfo, InstanceSlot};
use crate::model::{CanonicalObservation, ProviderId};

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Sinks
// ============================================================================

/// How an instance is prepared before a run writes into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    /// Clear it.
    Empty,
    /// Replace its content with a copy of the active instance.
    CopyFromActive,
    /// Leave it as an interrupted run left it.
    Keep,
}

#[async_trait]
pub trait ObservationSink: Send + Sync {
    async fn prepare_instance(
        &self,
        provider_id: ProviderId,
        instance: InstanceSlot,
        mode: PrepareMode,
    ) -> Result<(), SinkError>;

    /// Idempotent upsert keyed by occurrence id. Returns the number written.
    async fn upsert(
        &self,
        provider_id: ProviderId,
        instance: InstanceSlot,
        batch: &[CanonicalObservation],
    ) -> Result<usize, SinkError>;
}

#[async_trait]
pub trait InvalidRecordSink: Send + Sync {
    async fn append(&self, records: &[InvalidRecord]) -> Result<(), SinkError>;
}

#[async_trait]
pub trait InstanceToggle: Send + Sync {
    async fn active_instance(&self, provider_id: ProviderId) -> Result<InstanceSlot, SinkError>;

    /// Makes `instance` the one consumers read.
    async fn activate(&self, provider_id: ProviderId, instance: InstanceSlot)
        -> Result<(), SinkError>;
}

#[async_trait]
pub trait HarvestInfoStore: Send + Sync {
    async fn load(&self, provider_id: ProviderId) -> Result<Option<HarvestInfo>, SinkError>;

    async fn save(&self, info: &HarvestInfo) -> Result<(), SinkError>;
}

/// The collaborators a runner writes through.
#[derive(Clone)]
pub struct HarvestServices {
    pub sink: Arc<dyn ObservationSink>,
    pub invalid_sink: Arc<dyn InvalidRecordSink>,
    pub toggle: Arc<dyn InstanceToggle>,
    pub info_store: Arc<dyn HarvestInfoStore>,
}
