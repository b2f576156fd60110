//! The per-provider harvest loop.
//!
//! [`HarvestRunner`] drives one [`SourceConnector`] through a bounded pull
//! loop:
//! 1. **Prepare**: pick the inactive instance (or the one an interrupted run
//!    left behind) and prepare it for the run's mode
//! 2. **Pull**: fetch the next batch after the cursor, pacing calls so two
//!    pulls never start closer than the configured interval
//! 3. **Harmonize**: convert the batch against the current reference snapshot
//! 4. **Write**: upsert valid records, append rejected ones, advance the cursor
//!    and persist progress
//! 5. **Toggle**: once the source is exhausted, make the written instance
//!    active
//!
//! Cancellation is honoured at batch boundaries only, so the recorded cursor
//! always belongs to a fully written batch.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{AreaSettings, HarvestSettings, HarvesterConfig};
use crate::harmonize::{ObservationHarmonizer, ProviderContext};
use crate::harvest::cursor::HarvestCursor;
use crate::harvest::info::{HarvestInfo, HarvestMode, HarvestStatus, RunStart};
use crate::harvest::traits::{HarvestServices, PrepareMode, SinkError};
use crate::mapping::MappingDescriptor;
use crate::sensitivity::SensitivityGeneralizer;
use crate::snapshot::SnapshotStore;
use crate::traits::{ConnectorError, SourceConnector};

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Connector failed: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Connector reported more data but the cursor did not advance")]
    Stalled,

    #[error("Connector serves provider {connector} but the descriptor is for provider {descriptor}")]
    ProviderMismatch { connector: u32, descriptor: u32 },
}

// ============================================================================
// Jobs
// ============================================================================

/// One provider's harvest: its connector, how to map its records, and the mode.
#[derive(Clone)]
pub struct HarvestJob {
    pub connector: Arc<dyn SourceConnector>,
    pub descriptor: Arc<MappingDescriptor>,
    pub mode: HarvestMode,
}

impl HarvestJob {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        descriptor: Arc<MappingDescriptor>,
        mode: HarvestMode,
    ) -> Self {
        Self {
            connector,
            descriptor,
            mode,
        }
    }
}

enum RunOutcome {
    Completed,
    Canceled,
}

/// Spaces the *starts* of consecutive calls by at least `interval`; the time
/// a call takes counts towards the gap.
struct CallPacer {
    interval: Duration,
    last_start: Option<Instant>,
}

impl CallPacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: None,
        }
    }

    async fn ready(&mut self) {
        if let Some(last) = self.last_start {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_start = Some(Instant::now());
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct HarvestRunner {
    snapshots: Arc<SnapshotStore>,
    generalizer: SensitivityGeneralizer,
    area_settings: AreaSettings,
    settings: HarvestSettings,
    services: HarvestServices,
}

impl HarvestRunner {
    pub fn new(
        config: &HarvesterConfig,
        snapshots: Arc<SnapshotStore>,
        services: HarvestServices,
    ) -> Self {
        Self {
            snapshots,
            generalizer: SensitivityGeneralizer::new(&config.sensitivity),
            area_settings: config.areas.clone(),
            settings: config.harvest.clone(),
            services,
        }
    }

    pub fn services(&self) -> &HarvestServices {
        &self.services
    }

    /// Loads the provider's last run, plans where to start and runs.
    ///
    /// Never fails: problems are reported through the returned info's status
    /// and message.
    pub async fn run_job(&self, job: &HarvestJob, cancel: &CancellationToken) -> HarvestInfo {
        let provider = job.descriptor.provider_id;
        let last = match self.services.info_store.load(provider).await {
            Ok(last) => last,
            Err(e) => {
                error!(provider, error = %e, "Failed to load harvest info");
                return HarvestInfo::failed(provider, job.mode, None, e.to_string());
            }
        };
        let start = RunStart::plan(job.mode, last.as_ref());
        self.run(job, start, last.as_ref(), cancel).await
    }

    /// Runs one harvest from `start`.
    ///
    /// The returned info is also persisted: once when the run starts, after
    /// every batch and when it ends.
    #[instrument(skip_all, fields(provider = job.descriptor.provider_id, mode = ?job.mode))]
    pub async fn run(
        &self,
        job: &HarvestJob,
        start: RunStart,
        previous: Option<&HarvestInfo>,
        cancel: &CancellationToken,
    ) -> HarvestInfo {
        let provider = job.descriptor.provider_id;
        let mut info = HarvestInfo::begin(provider, job.mode, &start, previous, Utc::now());

        info!(
            since = ?start.since,
            resume = start.resume_instance.is_some(),
            "Starting harvest"
        );

        let outcome = self.drive(job, start, &mut info, cancel).await;
        info.end = Some(Utc::now());
        match outcome {
            Ok(RunOutcome::Completed) => {
                info.status = HarvestStatus::Succeeded;
                info.committed_cursor = info.cursor.clone();
                info!(
                    count = info.count,
                    batches = info.batches,
                    invalid = info.invalid_count,
                    soft_defects = info.soft_defect_count,
                    cursor = ?info.cursor,
                    instance = ?info.instance,
                    "Harvest succeeded"
                );
            }
            Ok(RunOutcome::Canceled) => {
                info.status = HarvestStatus::Canceled;
                info!(
                    count = info.count,
                    batches = info.batches,
                    cursor = ?info.cursor,
                    "Harvest canceled"
                );
            }
            Err(e) => {
                info.status = HarvestStatus::Failed;
                info.message = Some(e.to_string());
                error!(
                    error = %e,
                    batches = info.batches,
                    cursor = ?info.cursor,
                    "Harvest failed, previous instance stays active"
                );
            }
        }

        if let Err(e) = self.services.info_store.save(&info).await {
            error!(error = %e, "Failed to persist harvest info");
        }
        info
    }

    async fn drive(
        &self,
        job: &HarvestJob,
        mut start: RunStart,
        info: &mut HarvestInfo,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, HarvestError> {
        let descriptor = &job.descriptor;
        let provider = descriptor.provider_id;
        if job.connector.provider_id() != provider {
            return Err(HarvestError::ProviderMismatch {
                connector: job.connector.provider_id(),
                descriptor: provider,
            });
        }

        // ====================================================================
        // Prepare
        // ====================================================================

        let active = self.services.toggle.active_instance(provider).await?;
        if start.resume_instance == Some(active) {
            // The interrupted run got as far as the toggle; its instance is live.
            warn!(instance = ?active, "Interrupted run owns the active instance, starting over");
            start = start.restart(job.mode);
            info.cursor_before = start.since.clone();
            info.cursor = start.since.clone();
        }
        let (instance, prepare) = match start.resume_instance {
            Some(instance) => (instance, PrepareMode::Keep),
            None => {
                let prepare = match job.mode {
                    HarvestMode::Full => PrepareMode::Empty,
                    HarvestMode::Incremental => PrepareMode::CopyFromActive,
                };
                (active.other(), prepare)
            }
        };
        info.instance = instance;
        self.services
            .sink
            .prepare_instance(provider, instance, prepare)
            .await?;
        self.services.info_store.save(info).await?;

        // ====================================================================
        // Pull loop
        // ====================================================================

        let context = ProviderContext::new(descriptor.clone(), info.start);
        let mut cursor = HarvestCursor::new(start.since.clone());
        let interval = job
            .connector
            .min_call_interval()
            .unwrap_or(Duration::from_millis(self.settings.min_call_interval_ms));
        let mut pacer = CallPacer::new(interval);
        let mut pulled = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Canceled);
            }

            let max_batch = match self.settings.max_records {
                Some(max) => self.settings.batch_size.min(max.saturating_sub(pulled)),
                None => self.settings.batch_size,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RunOutcome::Canceled),
                _ = pacer.ready() => {}
            }
            let batch = job.connector.pull(cursor.position(), max_batch).await?;
            pulled += batch.records.len();

            // A snapshot published mid-run applies from the next batch on.
            let harmonizer = ObservationHarmonizer::new(
                self.snapshots.current(),
                self.generalizer.clone(),
                self.area_settings.clone(),
            );
            let harmonized = harmonizer.harmonize_batch(&batch.records, &context);

            if !harmonized.invalid.is_empty() {
                self.services
                    .invalid_sink
                    .append(&harmonized.invalid)
                    .await?;
            }
            let written = if harmonized.observations.is_empty() {
                0
            } else {
                self.services
                    .sink
                    .upsert(provider, instance, &harmonized.observations)
                    .await?
            };

            let moved = match &batch.watermark {
                Some(watermark) => cursor.advance(watermark).map_err(ConnectorError::from)?,
                None => false,
            };

            info.batches += 1;
            info.count += batch.records.len();
            info.invalid_count += harmonized.invalid.len();
            info.soft_defect_count += harmonized.soft_defects;
            info.cursor = cursor.position().cloned();
            self.services.info_store.save(info).await?;

            info!(
                batch = info.batches,
                records = batch.records.len(),
                written,
                invalid = harmonized.invalid.len(),
                cursor = ?info.cursor,
                "Processed batch"
            );

            if !batch.has_more {
                break;
            }
            if !moved {
                return Err(HarvestError::Stalled);
            }
            if let Some(max) = self.settings.max_records {
                if pulled >= max {
                    warn!(max_records = max, "Stopping at configured record limit");
                    break;
                }
            }
        }

        // ====================================================================
        // Toggle
        // ====================================================================

        self.services.toggle.activate(provider, instance).await?;
        Ok(RunOutcome::Completed)
    }
}

// ============================================================================
// Tests
// ============================================================================
