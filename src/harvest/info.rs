//! Per-provider harvest bookkeeping.
//!
//! A run writes into the *inactive* instance of its provider and only a
//! successful run flips that instance active. [`HarvestInfo`] records which
//! instance a run wrote to and how far it got, which is what lets an
//! interrupted run resume instead of restarting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::harvest::cursor::Watermark;
use crate::model::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStatus {
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl HarvestStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, HarvestStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSlot {
    Primary,
    Secondary,
}

impl InstanceSlot {
    pub fn other(self) -> Self {
        match self {
            InstanceSlot::Primary => InstanceSlot::Secondary,
            InstanceSlot::Secondary => InstanceSlot::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestMode {
    /// Rebuild the provider's data from scratch.
    Full,
    /// Pull changes since the last committed watermark on top of the active data.
    Incremental,
}

/// Summary of the run before this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousRun {
    pub status: HarvestStatus,
    pub end: Option<DateTime<Utc>>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestInfo {
    pub provider_id: ProviderId,
    pub mode: HarvestMode,
    pub instance: InstanceSlot,
    pub status: HarvestStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Records pulled from the source by this run, valid or not.
    pub count: usize,
    pub batches: usize,
    pub invalid_count: usize,
    pub soft_defect_count: usize,
    pub cursor_before: Option<Watermark>,
    /// Watermark of the last fully processed batch.
    pub cursor: Option<Watermark>,
    /// Watermark of the data in the provider's active instance.
    pub committed_cursor: Option<Watermark>,
    pub message: Option<String>,
    pub previous: Option<PreviousRun>,
}

impl HarvestInfo {
    pub fn begin(
        provider_id: ProviderId,
        mode: HarvestMode,
        start: &RunStart,
        previous: Option<&HarvestInfo>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id,
            mode,
            instance: start.resume_instance.unwrap_or(InstanceSlot::Secondary),
            status: HarvestStatus::InProgress,
            start: now,
            end: None,
            count: 0,
            batches: 0,
            invalid_count: 0,
            soft_defect_count: 0,
            cursor_before: start.since.clone(),
            cursor: start.since.clone(),
            committed_cursor: start.committed.clone(),
            message: None,
            previous: previous.map(|p| PreviousRun {
                status: p.status,
                end: p.end,
                count: p.count,
            }),
        }
    }

    /// A run that failed before it could start.
    pub fn failed(
        provider_id: ProviderId,
        mode: HarvestMode,
        previous: Option<&HarvestInfo>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let committed = previous.and_then(|p| p.committed_cursor.clone());
        let start = RunStart {
            since: committed.clone(),
            committed,
            resume_instance: None,
        };
        let mut info = Self::begin(provider_id, mode, &start, previous, now);
        info.status = HarvestStatus::Failed;
        info.end = Some(now);
        info.message = Some(message.into());
        info
    }
}

/// Where a run starts: the watermark to pull from, the watermark already
/// committed, and the instance to continue writing into when resuming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStart {
    pub since: Option<Watermark>,
    pub committed: Option<Watermark>,
    pub resume_instance: Option<InstanceSlot>,
}

impl RunStart {
    pub fn fresh(since: Option<Watermark>) -> Self {
        Self {
            committed: since.clone(),
            since,
            resume_instance: None,
        }
    }

    /// Plans a run from the provider's last recorded run.
    ///
    /// A canceled (or never finished) run of the same mode is resumed from its
    /// last processed batch, into the instance it was writing. Otherwise a
    /// full run starts from nothing and an incremental run from the committed
    /// watermark.
    pub fn plan(mode: HarvestMode, last: Option<&HarvestInfo>) -> Self {
        let Some(last) = last else {
            return Self::default();
        };
        let committed = last.committed_cursor.clone();

        let interrupted = matches!(
            last.status,
            HarvestStatus::Canceled | HarvestStatus::InProgress
        );
        if interrupted && last.mode == mode {
            return Self {
                since: last.cursor.clone(),
                committed,
                resume_instance: Some(last.instance),
            };
        }

        Self {
            since: None,
            committed,
            resume_instance: None,
        }
        .restart(mode)
    }

    /// Drops any resume and starts where a fresh run of `mode` would.
    pub fn restart(self, mode: HarvestMode) -> Self {
        Self {
            since: match mode {
                HarvestMode::Full => None,
                HarvestMode::Incremental => self.committed.clone(),
            },
            committed: self.committed,
            resume_instance: None,
        }
    }
}
