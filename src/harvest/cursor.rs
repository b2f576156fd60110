//! Provider watermarks and the cursor that tracks the highest one seen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Provider-specific harvest progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Watermark {
    /// Last modification time seen.
    Timestamp(DateTime<Utc>),
    /// Highest auto-increment id seen.
    Id(i64),
    ChangeSequence(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot compare a {current} watermark with a {incoming} watermark")]
pub struct WatermarkKindMismatch {
    pub current: &'static str,
    pub incoming: &'static str,
}

impl Watermark {
    pub fn kind(&self) -> &'static str {
        match self {
            Watermark::Timestamp(_) => "timestamp",
            Watermark::Id(_) => "id",
            Watermark::ChangeSequence(_) => "change sequence",
        }
    }

    pub fn try_cmp(&self, other: &Watermark) -> Result<Ordering, WatermarkKindMismatch> {
        match (self, other) {
            (Watermark::Timestamp(a), Watermark::Timestamp(b)) => Ok(a.cmp(b)),
            (Watermark::Id(a), Watermark::Id(b)) => Ok(a.cmp(b)),
            (Watermark::ChangeSequence(a), Watermark::ChangeSequence(b)) => Ok(a.cmp(b)),
            _ => Err(WatermarkKindMismatch {
                current: self.kind(),
                incoming: other.kind(),
            }),
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Watermark::Id(id) => write!(f, "id {id}"),
            Watermark::ChangeSequence(seq) => write!(f, "seq {seq}"),
        }
    }
}

/// Forward-only position within a provider's data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestCursor {
    position: Option<Watermark>,
}

impl HarvestCursor {
    pub fn new(position: Option<Watermark>) -> Self {
        Self { position }
    }

    pub fn position(&self) -> Option<&Watermark> {
        self.position.as_ref()
    }

    /// Moves to `watermark` when it is ahead of the current position.
    /// Returns whether the cursor moved.
    pub fn advance(&mut self, watermark: &Watermark) -> Result<bool, WatermarkKindMismatch> {
        let ahead = match &self.position {
            None => true,
            Some(current) => current.try_cmp(watermark)? == Ordering::Less,
        };
        if ahead {
            self.position = Some(watermark.clone());
        }
        Ok(ahead)
    }

    pub fn into_inner(self) -> Option<Watermark> {
        self.position
    }
}
