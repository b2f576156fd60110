//! Canonical observation model.
//!
//! [`CanonicalObservation`] is a closed, versioned struct: every field the
//! harmonizer understands has a typed home, and genuinely provider-specific
//! leftovers go into the single `extensions` map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::area::{AreaId, AreaType};
use crate::geometry::Coordinate;
use crate::sensitivity::{Disclosure, SensitivityCategory};
use crate::taxon::TaxonId;
use crate::vocabulary::{VocabularyField, VocabularyTerm};

pub type ProviderId = u32;

/// Bumped whenever a field is added to or removed from the canonical record.
pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalObservation {
    pub schema_version: u16,
    /// Stable URN, derived only from the provider namespace and source id.
    pub occurrence_id: String,
    pub provider_id: ProviderId,
    pub dataset_id: String,
    pub taxon: TaxonRef,
    pub event: Event,
    pub location: Location,
    pub occurrence: Occurrence,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_issues: Vec<SoftDefect>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl CanonicalObservation {
    pub fn is_restricted(&self) -> bool {
        self.location.is_restricted()
    }

    /// The record as non-privileged consumers may see it. Restricted records
    /// lose their true coordinate, its uncertainty and the areas derived from
    /// it, and the verbatim locality; public areas take their place.
    pub fn public_view(&self) -> CanonicalObservation {
        let mut view = self.clone();
        if view.location.is_restricted() {
            view.location.true_coordinate = None;
            view.location.coordinate_uncertainty_m = None;
            view.location.areas = view.location.public_areas.clone();
            view.location.locality = None;
        }
        view
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonRef {
    pub id: TaxonId,
    pub scientific_name: String,
    pub rank: String,
    /// The reference exactly as the provider sent it.
    pub verbatim: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub true_coordinate: Option<Coordinate>,
    pub coordinate_uncertainty_m: Option<u32>,
    pub public_coordinate: Option<Coordinate>,
    pub public_uncertainty_m: Option<u32>,
    pub disclosure: Disclosure,
    /// Areas containing (or near) the true coordinate.
    pub areas: Vec<AreaMembership>,
    /// Areas containing the public coordinate.
    pub public_areas: Vec<AreaMembership>,
    pub locality: Option<String>,
}

impl Location {
    pub fn is_restricted(&self) -> bool {
        self.disclosure != Disclosure::Exact
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaMembership {
    pub area_id: AreaId,
    pub area_type: AreaType,
    pub feature_id: String,
    pub name: String,
    pub matched: AreaMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AreaMatch {
    Contains,
    Nearest { distance_m: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub status: OccurrenceStatus,
    pub catalog_number: String,
    pub recorded_by: Option<String>,
    pub individual_count: Option<u32>,
    pub sensitivity_category: SensitivityCategory,
    /// Resolved (or free-text) coded fields, keyed by field.
    #[serde(default)]
    pub terms: BTreeMap<VocabularyField, VocabularyTerm>,
}

impl Occurrence {
    pub fn term(&self, field: VocabularyField) -> Option<&VocabularyTerm> {
        self.terms.get(&field)
    }
}

/// A problem that does not reject the record but is kept with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SoftDefect {
    UnresolvedVocabulary { field: VocabularyField, value: String },
    NoAreaMatch { area_type: AreaType },
    MissingOptionalField { field: String },
}
