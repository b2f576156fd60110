//! Per-provider record shapes and the descriptors that map them.
//!
//! A provider is described by a [`MappingDescriptor`], which is plain data
//! loaded from configuration: which shape its records come in, what its
//! columns are called, and how its occurrence URNs are namespaced. Every raw
//! record is first extracted into a [`VerbatimRecord`], the common verbatim
//! form the harmonizer works on.
//!
//! Shapes:
//! - [`dwc`]: Darwin Core term maps, as read from DwC-A files
//! - [`tabular`]: typed rows from relational sources, keyed by column name
//! - structured records from services that already deliver a [`VerbatimRecord`]

pub mod dwc;
pub mod tabular;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::geometry::Coordinate;
use crate::harmonize::HarmonizationDefect;
use crate::model::ProviderId;
use crate::taxon::TaxonId;
use crate::vocabulary::VocabularyField;

pub use dwc::DwcRecord;
pub use tabular::{CellValue, SourceRow};

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    DarwinCore,
    Tabular,
    Structured,
}

/// Column (or Darwin Core term) names used to read a provider's records.
/// Defaults are the Darwin Core term names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub source_id: String,
    pub catalog_number: String,
    pub taxon_id: String,
    pub scientific_name: String,
    pub latitude: String,
    pub longitude: String,
    pub coordinate_uncertainty: String,
    pub locality: String,
    pub event_date: String,
    /// Separate end-date column, for sources that split the interval.
    pub end_date: Option<String>,
    pub recorded_by: String,
    pub individual_count: String,
    pub sensitivity: String,
    pub modified: String,
    /// Boolean absence-flag column, for sources that record non-detections
    /// outside `occurrenceStatus`.
    pub absent: Option<String>,
    pub coded: BTreeMap<VocabularyField, String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        let coded = [
            (VocabularyField::Sex, "sex"),
            (VocabularyField::LifeStage, "lifeStage"),
            (VocabularyField::Activity, "behavior"),
            (VocabularyField::BasisOfRecord, "basisOfRecord"),
            (VocabularyField::OccurrenceStatus, "occurrenceStatus"),
            (VocabularyField::AccessRights, "accessRights"),
            (VocabularyField::Institution, "institutionCode"),
        ]
        .into_iter()
        .map(|(field, column)| (field, column.to_string()))
        .collect();

        Self {
            source_id: "occurrenceID".into(),
            catalog_number: "catalogNumber".into(),
            taxon_id: "taxonID".into(),
            scientific_name: "scientificName".into(),
            latitude: "decimalLatitude".into(),
            longitude: "decimalLongitude".into(),
            coordinate_uncertainty: "coordinateUncertaintyInMeters".into(),
            locality: "locality".into(),
            event_date: "eventDate".into(),
            end_date: None,
            recorded_by: "recordedBy".into(),
            individual_count: "individualCount".into(),
            sensitivity: "sensitivityCategory".into(),
            modified: "modified".into(),
            absent: None,
            coded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDescriptor {
    pub provider_id: ProviderId,
    pub name: String,
    pub dataset_id: String,
    /// Authority part of the occurrence URN, e.g. `artportalen.se`.
    pub namespace: String,
    pub kind: SourceKind,
    #[serde(default = "default_object_type")]
    pub object_type: String,
    #[serde(default)]
    pub columns: ColumnMapping,
    /// Whether a record without a coordinate is rejected.
    #[serde(default = "default_true")]
    pub coordinate_required: bool,
    #[serde(default)]
    pub default_uncertainty_m: Option<u32>,
    /// Source fields copied verbatim into the record's extension map.
    #[serde(default)]
    pub extension_fields: Vec<String>,
}

fn default_object_type() -> String {
    "observation".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("provider {provider_id}: '{field}' must not be empty")]
    EmptyField {
        provider_id: ProviderId,
        field: &'static str,
    },

    #[error("provider {provider_id}: '{value}' is not a valid URN segment")]
    InvalidUrnSegment {
        provider_id: ProviderId,
        value: String,
    },
}

impl MappingDescriptor {
    pub fn new(
        provider_id: ProviderId,
        name: impl Into<String>,
        dataset_id: impl Into<String>,
        namespace: impl Into<String>,
        kind: SourceKind,
    ) -> Self {
        Self {
            provider_id,
            name: name.into(),
            dataset_id: dataset_id.into(),
            namespace: namespace.into(),
            kind,
            object_type: default_object_type(),
            columns: ColumnMapping::default(),
            coordinate_required: true,
            default_uncertainty_m: None,
            extension_fields: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        let required = [
            ("name", &self.name),
            ("dataset_id", &self.dataset_id),
            ("namespace", &self.namespace),
            ("object_type", &self.object_type),
            ("columns.source_id", &self.columns.source_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DescriptorError::EmptyField {
                    provider_id: self.provider_id,
                    field,
                });
            }
        }
        for segment in [&self.namespace, &self.object_type] {
            if segment.contains(|c: char| c == ':' || c.is_whitespace()) {
                return Err(DescriptorError::InvalidUrnSegment {
                    provider_id: self.provider_id,
                    value: segment.clone(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Record Shapes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaxonReference {
    Id(TaxonId),
    ScientificName(String),
}

impl fmt::Display for TaxonReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaxonReference::Id(id) => write!(f, "{id}"),
            TaxonReference::ScientificName(name) => f.write_str(name),
        }
    }
}

/// The common verbatim form every record shape is extracted into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerbatimRecord {
    pub source_id: String,
    pub catalog_number: Option<String>,
    pub taxon: Option<TaxonReference>,
    pub coordinate: Option<Coordinate>,
    pub coordinate_uncertainty_m: Option<u32>,
    pub locality: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub recorded_by: Option<String>,
    pub individual_count: Option<u32>,
    /// Explicit absence flag, for sources that have one.
    pub is_absent: Option<bool>,
    pub sensitivity_hint: Option<u8>,
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub coded: BTreeMap<VocabularyField, String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A record as pulled from a connector, one variant per source shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "record", rename_all = "snake_case")]
pub enum RawObservation {
    DarwinCore(DwcRecord),
    Tabular(SourceRow),
    Structured(VerbatimRecord),
}

impl RawObservation {
    pub fn kind(&self) -> SourceKind {
        match self {
            RawObservation::DarwinCore(_) => SourceKind::DarwinCore,
            RawObservation::Tabular(_) => SourceKind::Tabular,
            RawObservation::Structured(_) => SourceKind::Structured,
        }
    }

    /// Best-effort source id, used to label rejected records.
    pub fn source_id(&self, descriptor: &MappingDescriptor) -> Option<String> {
        match self {
            RawObservation::DarwinCore(r) => r.text(&descriptor.columns.source_id),
            RawObservation::Tabular(r) => r.text(&descriptor.columns.source_id),
            RawObservation::Structured(r) => {
                Some(r.source_id.trim().to_string()).filter(|s| !s.is_empty())
            }
        }
    }
}

/// Converts any record shape into its verbatim form, collecting every hard
/// defect found on the way.
pub fn extract(
    raw: &RawObservation,
    descriptor: &MappingDescriptor,
) -> Result<VerbatimRecord, Vec<HarmonizationDefect>> {
    match (raw, descriptor.kind) {
        (RawObservation::DarwinCore(record), SourceKind::DarwinCore) => {
            extract_fields(record, descriptor)
        }
        (RawObservation::Tabular(row), SourceKind::Tabular) => extract_fields(row, descriptor),
        (RawObservation::Structured(record), SourceKind::Structured) => {
            if record.source_id.trim().is_empty() {
                return Err(vec![HarmonizationDefect::MissingSourceId]);
            }
            Ok(record.clone())
        }
        (raw, expected) => Err(vec![HarmonizationDefect::ShapeMismatch {
            expected,
            found: raw.kind(),
        }]),
    }
}

// ============================================================================
// Field Extraction
// ============================================================================

/// Read access to a keyed record. Typed accessors return `Err(raw)` when a
/// value is present but cannot be read as the requested type.
pub(crate) trait FieldSource {
    /// Trimmed, non-empty text of a column.
    fn text(&self, column: &str) -> Option<String>;

    fn float(&self, column: &str) -> Result<Option<f64>, String> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => raw.replace(',', ".").parse::<f64>().map(Some).map_err(|_| raw),
        }
    }

    fn integer(&self, column: &str) -> Result<Option<i64>, String> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| raw),
        }
    }

    fn boolean(&self, column: &str) -> Result<Option<bool>, String> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => match raw.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(raw),
            },
        }
    }

    fn timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, String> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => parse_bound(&raw, Bound::Start).map(Some).ok_or(raw),
        }
    }

    fn interval(&self, column: &str) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, String> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => parse_interval(&raw).map(Some).ok_or(raw),
        }
    }

    fn json(&self, column: &str) -> Option<serde_json::Value> {
        self.text(column).map(serde_json::Value::String)
    }
}

fn malformed(field: &str, value: impl Into<String>) -> HarmonizationDefect {
    HarmonizationDefect::MalformedField {
        field: field.to_string(),
        value: value.into(),
    }
}

fn extract_fields<S: FieldSource>(
    source: &S,
    descriptor: &MappingDescriptor,
) -> Result<VerbatimRecord, Vec<HarmonizationDefect>> {
    let c = &descriptor.columns;
    let mut defects = Vec::new();

    let source_id = source.text(&c.source_id);
    if source_id.is_none() {
        defects.push(HarmonizationDefect::MissingSourceId);
    }

    let taxon = match source.text(&c.taxon_id) {
        Some(raw) => match parse_taxon_id(&raw) {
            Some(id) => Some(TaxonReference::Id(id)),
            None => match source.text(&c.scientific_name) {
                Some(name) => Some(TaxonReference::ScientificName(name)),
                None => {
                    defects.push(malformed(&c.taxon_id, raw));
                    None
                }
            },
        },
        None => source
            .text(&c.scientific_name)
            .map(TaxonReference::ScientificName),
    };

    let coordinate_defects = defects.len();
    let latitude = source
        .float(&c.latitude)
        .unwrap_or_else(|raw| {
            defects.push(malformed(&c.latitude, raw));
            None
        });
    let longitude = source
        .float(&c.longitude)
        .unwrap_or_else(|raw| {
            defects.push(malformed(&c.longitude, raw));
            None
        });
    let coordinate = match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        (Some(_), None) | (None, Some(_)) if defects.len() == coordinate_defects => {
            let missing = if latitude.is_none() { &c.latitude } else { &c.longitude };
            defects.push(malformed(missing, ""));
            None
        }
        _ => None,
    };

    let coordinate_uncertainty_m = match source.float(&c.coordinate_uncertainty) {
        Ok(Some(v)) if v >= 0.0 && v.is_finite() => Some(v.ceil() as u32),
        Ok(Some(v)) => {
            defects.push(malformed(&c.coordinate_uncertainty, v.to_string()));
            None
        }
        Ok(None) => descriptor.default_uncertainty_m,
        Err(raw) => {
            defects.push(malformed(&c.coordinate_uncertainty, raw));
            None
        }
    };

    let (start, mut end) = match source.interval(&c.event_date) {
        Ok(Some((start, end))) => (Some(start), Some(end)),
        Ok(None) => (None, None),
        Err(raw) => {
            defects.push(malformed(&c.event_date, raw));
            (None, None)
        }
    };
    if let Some(column) = &c.end_date {
        match source.interval(column) {
            Ok(Some((_, explicit_end))) => end = Some(explicit_end),
            Ok(None) => {}
            Err(raw) => defects.push(malformed(column, raw)),
        }
    }

    let individual_count = match source.integer(&c.individual_count) {
        Ok(Some(n)) => match u32::try_from(n) {
            Ok(n) => Some(n),
            Err(_) => {
                defects.push(malformed(&c.individual_count, n.to_string()));
                None
            }
        },
        Ok(None) => None,
        Err(raw) => {
            defects.push(malformed(&c.individual_count, raw));
            None
        }
    };

    let sensitivity_hint = match source.integer(&c.sensitivity) {
        Ok(Some(n)) => match u8::try_from(n) {
            Ok(n) => Some(n),
            Err(_) => {
                defects.push(malformed(&c.sensitivity, n.to_string()));
                None
            }
        },
        Ok(None) => None,
        Err(raw) => {
            defects.push(malformed(&c.sensitivity, raw));
            None
        }
    };

    let modified = source.timestamp(&c.modified).unwrap_or_else(|raw| {
        defects.push(malformed(&c.modified, raw));
        None
    });

    let is_absent = match &c.absent {
        Some(column) => source.boolean(column).unwrap_or_else(|raw| {
            defects.push(malformed(column, raw));
            None
        }),
        None => None,
    };

    if !defects.is_empty() {
        return Err(defects);
    }

    let coded = c
        .coded
        .iter()
        .filter_map(|(field, column)| source.text(column).map(|v| (*field, v)))
        .collect();
    let extra = descriptor
        .extension_fields
        .iter()
        .filter_map(|name| source.json(name).map(|v| (name.clone(), v)))
        .collect();

    Ok(VerbatimRecord {
        source_id: source_id.unwrap_or_default(),
        catalog_number: source.text(&c.catalog_number),
        taxon,
        coordinate,
        coordinate_uncertainty_m,
        locality: source.text(&c.locality),
        start,
        end,
        recorded_by: source.text(&c.recorded_by),
        individual_count,
        is_absent,
        sensitivity_hint,
        modified,
        coded,
        extra,
    })
}

/// Accepts bare ids and LSID-style references such as
/// `urn:lsid:dyntaxa.se:Taxon:100024`.
fn parse_taxon_id(raw: &str) -> Option<TaxonId> {
    raw.rsplit(':').next()?.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Start,
    End,
}

/// Parses one side of an ISO 8601 interval. Date-only values expand to the
/// start or end of that day.
fn parse_bound(raw: &str, bound: Bound) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = match bound {
        Bound::Start => NaiveTime::MIN,
        Bound::End => NaiveTime::from_hms_opt(23, 59, 59)?,
    };
    Some(date.and_time(time).and_utc())
}

/// `start/end` or a single value, which then serves as both bounds.
pub(crate) fn parse_interval(raw: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = raw.split_once('/').unwrap_or((raw, raw));
    Some((parse_bound(start, Bound::Start)?, parse_bound(end, Bound::End)?))
}
