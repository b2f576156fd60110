//! Conversion of provider records into canonical observations.
//!
//! One harmonization function serves every provider; what differs between
//! providers is the [`MappingDescriptor`] passed in the [`ProviderContext`].
//!
//! Per record:
//! 1. extract the verbatim form for the descriptor's source kind
//! 2. resolve the taxon (hard defect when unknown)
//! 3. validate coordinate and event dates (hard defects)
//! 4. resolve coded fields (unresolved values stay as free text, soft defect)
//! 5. assign areas, falling back to the nearest area of each required type
//! 6. classify sensitivity and compute the public location
//! 7. derive status, catalog number and the stable occurrence URN

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::area::Area;
use crate::config::AreaSettings;
use crate::geometry::{self, Coordinate};
use crate::mapping::{self, MappingDescriptor, RawObservation, SourceKind, TaxonReference, VerbatimRecord};
use crate::model::{
    AreaMatch, AreaMembership, CanonicalObservation, Event, Location, Occurrence,
    OccurrenceStatus, ProviderId, SoftDefect, TaxonRef, SCHEMA_VERSION,
};
use crate::sensitivity::{Disclosure, SensitivityGeneralizer};
use crate::snapshot::ReferenceData;
use crate::vocabulary::{VocabularyField, VocabularyTerm};

// ============================================================================
// Defects
// ============================================================================

/// A problem that rejects the record.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarmonizationDefect {
    #[error("taxon '{reference}' not found")]
    TaxonNotFound { reference: String },

    #[error("record has no taxon reference")]
    MissingTaxonReference,

    #[error("record has no source id")]
    MissingSourceId,

    #[error("record has no coordinate")]
    MissingCoordinate,

    #[error("coordinate ({latitude}, {longitude}) is outside WGS84 bounds")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("record has no event date")]
    MissingEventDate,

    #[error("event ends ({end}) before it starts ({start})")]
    InvalidDateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("field '{field}' has malformed value '{value}'")]
    MalformedField { field: String, value: String },

    #[error("expected a {expected:?} record, got {found:?}")]
    ShapeMismatch {
        expected: SourceKind,
        found: SourceKind,
    },
}

/// A rejected record, as handed to the invalid-record sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidRecord {
    pub provider_id: ProviderId,
    pub source_id: Option<String>,
    pub defects: Vec<HarmonizationDefect>,
}

// ============================================================================
// Harmonizer
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub descriptor: Arc<MappingDescriptor>,
    /// Stands in for the modification time when a record carries none.
    pub harvested_at: DateTime<Utc>,
}

impl ProviderContext {
    pub fn new(descriptor: Arc<MappingDescriptor>, harvested_at: DateTime<Utc>) -> Self {
        Self {
            descriptor,
            harvested_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct HarmonizedBatch {
    /// Valid records, in input order.
    pub observations: Vec<CanonicalObservation>,
    pub invalid: Vec<InvalidRecord>,
    pub soft_defects: usize,
}

/// Harmonizes records against one reference snapshot.
#[derive(Debug, Clone)]
pub struct ObservationHarmonizer {
    reference: Arc<ReferenceData>,
    generalizer: SensitivityGeneralizer,
    area_settings: AreaSettings,
}

impl ObservationHarmonizer {
    pub fn new(
        reference: Arc<ReferenceData>,
        generalizer: SensitivityGeneralizer,
        area_settings: AreaSettings,
    ) -> Self {
        Self {
            reference,
            generalizer,
            area_settings,
        }
    }

    pub fn reference(&self) -> &Arc<ReferenceData> {
        &self.reference
    }

    /// Harmonizes one record.
    ///
    /// # Errors
    ///
    /// Returns every hard defect found; a record with any hard defect never
    /// yields a canonical observation.
    pub fn harmonize(
        &self,
        raw: &RawObservation,
        context: &ProviderContext,
    ) -> Result<CanonicalObservation, Vec<HarmonizationDefect>> {
        let verbatim = mapping::extract(raw, &context.descriptor)?;
        self.harmonize_verbatim(verbatim, context)
    }

    /// Harmonizes a batch, keeping input order. Rejected records are logged
    /// with their provenance and collected separately.
    pub fn harmonize_batch(
        &self,
        records: &[RawObservation],
        context: &ProviderContext,
    ) -> HarmonizedBatch {
        let descriptor = &context.descriptor;
        let mut batch = HarmonizedBatch::default();

        for raw in records {
            match self.harmonize(raw, context) {
                Ok(observation) => {
                    batch.soft_defects += observation.quality_issues.len();
                    batch.observations.push(observation);
                }
                Err(defects) => {
                    let source_id = raw.source_id(descriptor);
                    warn!(
                        provider = descriptor.provider_id,
                        dataset = %descriptor.dataset_id,
                        source_id = source_id.as_deref().unwrap_or("<none>"),
                        defects = ?defects,
                        "Rejected record"
                    );
                    batch.invalid.push(InvalidRecord {
                        provider_id: descriptor.provider_id,
                        source_id,
                        defects,
                    });
                }
            }
        }

        debug!(
            provider = descriptor.provider_id,
            valid = batch.observations.len(),
            invalid = batch.invalid.len(),
            soft_defects = batch.soft_defects,
            generation = self.reference.generation,
            "Harmonized batch"
        );
        batch
    }

    fn harmonize_verbatim(
        &self,
        v: VerbatimRecord,
        context: &ProviderContext,
    ) -> Result<CanonicalObservation, Vec<HarmonizationDefect>> {
        let descriptor = &context.descriptor;
        let mut defects = Vec::new();

        let source_id = v.source_id.trim().to_string();
        if source_id.is_empty() {
            defects.push(HarmonizationDefect::MissingSourceId);
        }

        let taxon = match &v.taxon {
            Some(TaxonReference::Id(id)) => self.reference.taxa.get(*id),
            Some(TaxonReference::ScientificName(name)) => self.reference.taxa.get_by_name(name),
            None => None,
        };
        match (&v.taxon, taxon) {
            (None, _) => defects.push(HarmonizationDefect::MissingTaxonReference),
            (Some(reference), None) => defects.push(HarmonizationDefect::TaxonNotFound {
                reference: reference.to_string(),
            }),
            _ => {}
        }

        match v.coordinate {
            Some(c) if !c.is_valid() => defects.push(HarmonizationDefect::InvalidCoordinate {
                latitude: c.latitude,
                longitude: c.longitude,
            }),
            None if descriptor.coordinate_required => {
                defects.push(HarmonizationDefect::MissingCoordinate)
            }
            _ => {}
        }

        let event = match v.start {
            Some(start) => {
                let end = v.end.unwrap_or(start);
                if end < start {
                    defects.push(HarmonizationDefect::InvalidDateRange { start, end });
                    None
                } else {
                    Some(Event { start, end })
                }
            }
            None => {
                defects.push(HarmonizationDefect::MissingEventDate);
                None
            }
        };

        let (taxon, event) = match (taxon, event) {
            (Some(taxon), Some(event)) if defects.is_empty() => (taxon, event),
            _ => return Err(defects),
        };

        let mut quality_issues = Vec::new();

        let mut terms = BTreeMap::new();
        for (field, raw) in &v.coded {
            let resolution =
                self.reference
                    .vocabulary
                    .resolve(*field, descriptor.provider_id, raw);
            if !resolution.is_resolved() {
                quality_issues.push(SoftDefect::UnresolvedVocabulary {
                    field: *field,
                    value: raw.clone(),
                });
            }
            terms.insert(*field, VocabularyTerm::from(resolution));
        }

        let category = self.generalizer.classify(taxon, v.sensitivity_hint);
        let location = match v.coordinate {
            Some(point) => {
                let areas =
                    self.assign_areas(&point, v.coordinate_uncertainty_m, Some(&mut quality_issues));
                let public =
                    self.generalizer
                        .generalize(&point, v.coordinate_uncertainty_m, taxon, category);
                let public_areas = match (public.disclosure, public.coordinate) {
                    (Disclosure::Exact, _) => areas.clone(),
                    (Disclosure::Generalized { .. }, Some(c)) => {
                        self.assign_areas(&c, public.uncertainty_m, None)
                    }
                    _ => Vec::new(),
                };
                Location {
                    true_coordinate: Some(point),
                    coordinate_uncertainty_m: v.coordinate_uncertainty_m,
                    public_coordinate: public.coordinate,
                    public_uncertainty_m: public.uncertainty_m,
                    disclosure: public.disclosure,
                    areas,
                    public_areas,
                    locality: v.locality.clone(),
                }
            }
            None => {
                quality_issues.push(SoftDefect::MissingOptionalField {
                    field: "coordinate".into(),
                });
                Location {
                    true_coordinate: None,
                    coordinate_uncertainty_m: None,
                    public_coordinate: None,
                    public_uncertainty_m: None,
                    disclosure: if category == 0 {
                        Disclosure::Exact
                    } else {
                        Disclosure::Withheld
                    },
                    areas: Vec::new(),
                    public_areas: Vec::new(),
                    locality: v.locality.clone(),
                }
            }
        };

        let status = occurrence_status(v.is_absent, terms.get(&VocabularyField::OccurrenceStatus));

        Ok(CanonicalObservation {
            schema_version: SCHEMA_VERSION,
            occurrence_id: occurrence_id(descriptor, &source_id),
            provider_id: descriptor.provider_id,
            dataset_id: descriptor.dataset_id.clone(),
            taxon: TaxonRef {
                id: taxon.id,
                scientific_name: taxon.scientific_name.clone(),
                rank: taxon.rank.clone(),
                verbatim: v.taxon.as_ref().map(ToString::to_string).unwrap_or_default(),
            },
            event,
            location,
            occurrence: Occurrence {
                status,
                catalog_number: v.catalog_number.unwrap_or_else(|| source_id.clone()),
                recorded_by: v.recorded_by,
                individual_count: v.individual_count,
                sensitivity_category: category,
                terms,
            },
            modified: v.modified.unwrap_or(context.harvested_at),
            quality_issues,
            extensions: v.extra,
        })
    }

    /// Areas containing `point`, plus for each required type without a
    /// containing area the nearest one within reach. Types left without a
    /// match are reported to `issues` when given.
    fn assign_areas(
        &self,
        point: &Coordinate,
        uncertainty_m: Option<u32>,
        mut issues: Option<&mut Vec<SoftDefect>>,
    ) -> Vec<AreaMembership> {
        let index = &self.reference.areas;
        let mut memberships: Vec<AreaMembership> = index
            .areas_containing(point)
            .into_iter()
            .map(|area| membership(area, AreaMatch::Contains))
            .collect();

        let reach = f64::from(
            uncertainty_m
                .unwrap_or(0)
                .max(self.area_settings.nearest_area_tolerance_m),
        );
        for &area_type in &self.area_settings.required_types {
            if memberships.iter().any(|m| m.area_type == area_type) {
                continue;
            }
            match index.nearest_area(point, area_type, reach) {
                Some(area) => {
                    let distance_m = geometry::distance_m(&area.geometry, point).round() as u32;
                    memberships.push(membership(area, AreaMatch::Nearest { distance_m }));
                }
                None => {
                    if let Some(issues) = issues.as_deref_mut() {
                        issues.push(SoftDefect::NoAreaMatch { area_type });
                    }
                }
            }
        }

        memberships.sort_by_key(|m| (m.area_type, m.area_id));
        memberships
    }
}

fn membership(area: &Area, matched: AreaMatch) -> AreaMembership {
    AreaMembership {
        area_id: area.id,
        area_type: area.area_type,
        feature_id: area.feature_id.clone(),
        name: area.name.clone(),
        matched,
    }
}

/// `urn:lsid:{namespace}:{object_type}:{source_id}`, unless the source id is
/// already a URN.
fn occurrence_id(descriptor: &MappingDescriptor, source_id: &str) -> String {
    if source_id.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("urn:")) {
        source_id.to_string()
    } else {
        format!(
            "urn:lsid:{}:{}:{}",
            descriptor.namespace, descriptor.object_type, source_id
        )
    }
}

fn occurrence_status(is_absent: Option<bool>, term: Option<&VocabularyTerm>) -> OccurrenceStatus {
    let absent = is_absent.unwrap_or_else(|| {
        term.is_some_and(|t| {
            matches!(
                t.value.trim().to_lowercase().as_str(),
                "absent" | "not present" | "not detected" | "notdetected"
            )
        })
    });
    if absent {
        OccurrenceStatus::Absent
    } else {
        OccurrenceStatus::Present
    }
}
