use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::harvest::cursor::{Watermark, WatermarkKindMismatch};
use crate::mapping::RawObservation;
use crate::model::ProviderId;

#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Timeouts, throttling. Retried inside the connector; reaching the
    /// runner means retries were exhausted.
    #[error("Transient source failure: {0}")]
    Transient(String),
    /// Authentication failures, schema changes.
    #[error("Source failure: {0}")]
    Fatal(String),
    #[error(transparent)]
    WatermarkKindMismatch(#[from] WatermarkKindMismatch),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One page pulled from a provider.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub records: Vec<RawObservation>,
    /// Highest watermark among `records`.
    pub watermark: Option<Watermark>,
    pub has_more: bool,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// The provider this connector pulls from.
    fn provider_id(&self) -> ProviderId;

    /// Minimum time between the starts of two pulls, overriding the
    /// configured default for rate-limited sources.
    fn min_call_interval(&self) -> Option<Duration> {
        None
    }

    /// Pulls up to `max_batch` records after `cursor`.
    async fn pull(
        &self,
        cursor: Option<&Watermark>,
        max_batch: usize,
    ) -> Result<SourceBatch, ConnectorError>;
}
