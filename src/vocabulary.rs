//! Resolution of provider-specific coded values to canonical vocabulary terms.
//!
//! Each provider may ship an external-system mapping per field ("hane" →
//! sex id 1, "M" → sex id 1, ...). Mappings without a provider apply to every
//! provider and are consulted after the provider's own table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::model::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyField {
    Sex,
    LifeStage,
    Activity,
    BasisOfRecord,
    OccurrenceStatus,
    AccessRights,
    Unit,
    Institution,
}

impl fmt::Display for VocabularyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VocabularyField::Sex => "sex",
            VocabularyField::LifeStage => "life_stage",
            VocabularyField::Activity => "activity",
            VocabularyField::BasisOfRecord => "basis_of_record",
            VocabularyField::OccurrenceStatus => "occurrence_status",
            VocabularyField::AccessRights => "access_rights",
            VocabularyField::Unit => "unit",
            VocabularyField::Institution => "institution",
        };
        f.write_str(name)
    }
}

/// One canonical term of a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyValue {
    pub id: i32,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub field: VocabularyField,
    pub values: Vec<VocabularyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingValue {
    pub raw: String,
    pub canonical_id: i32,
}

/// A provider's (or the shared) mapping table for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSystemMapping {
    pub field: VocabularyField,
    #[serde(default)]
    pub provider_id: Option<ProviderId>,
    pub values: Vec<MappingValue>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} mapping for {} maps '{raw}' to both {first_id} and {second_id}", provider_label(.provider_id))]
pub struct DuplicateMappingError {
    pub field: VocabularyField,
    pub provider_id: Option<ProviderId>,
    pub raw: String,
    pub first_id: i32,
    pub second_id: i32,
}

fn provider_label(provider_id: &Option<ProviderId>) -> String {
    match provider_id {
        Some(id) => format!("provider {id}"),
        None => "all providers".to_string(),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VocabularyError {
    #[error(transparent)]
    DuplicateMapping(#[from] DuplicateMappingError),

    #[error("{field} mapping refers to unknown vocabulary id {id}")]
    UnknownVocabularyId { field: VocabularyField, id: i32 },
}

/// Outcome of a lookup. Unresolved values keep the raw text so callers can
/// decide between passing it through and dropping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(VocabularyValue),
    Unresolved(String),
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

/// A coded field as stored on a canonical record. `id` is `None` when the
/// raw value could not be resolved and was kept as free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub id: Option<i32>,
    pub value: String,
}

impl From<Resolution> for VocabularyTerm {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Resolved(v) => VocabularyTerm {
                id: Some(v.id),
                value: v.value,
            },
            Resolution::Unresolved(raw) => VocabularyTerm {
                id: None,
                value: raw,
            },
        }
    }
}

type TableKey = (VocabularyField, Option<ProviderId>);

#[derive(Debug, Clone, Default)]
pub struct VocabularyResolver {
    terms: HashMap<(VocabularyField, i32), VocabularyValue>,
    tables: HashMap<TableKey, HashMap<String, i32>>,
}

impl VocabularyResolver {
    /// Loads vocabularies and mapping tables, validating that every table is
    /// unambiguous and only points at known terms.
    pub fn load(
        vocabularies: Vec<Vocabulary>,
        mappings: Vec<ExternalSystemMapping>,
    ) -> Result<Self, VocabularyError> {
        let mut terms = HashMap::new();
        for vocabulary in vocabularies {
            for value in vocabulary.values {
                terms.insert((vocabulary.field, value.id), value);
            }
        }

        let mut tables: HashMap<TableKey, HashMap<String, i32>> = HashMap::new();
        for mapping in mappings {
            let table = tables
                .entry((mapping.field, mapping.provider_id))
                .or_default();
            for value in mapping.values {
                if !terms.contains_key(&(mapping.field, value.canonical_id)) {
                    return Err(VocabularyError::UnknownVocabularyId {
                        field: mapping.field,
                        id: value.canonical_id,
                    });
                }
                let key = normalize(&value.raw);
                match table.get(&key) {
                    Some(&existing) if existing != value.canonical_id => {
                        return Err(DuplicateMappingError {
                            field: mapping.field,
                            provider_id: mapping.provider_id,
                            raw: value.raw,
                            first_id: existing,
                            second_id: value.canonical_id,
                        }
                        .into());
                    }
                    Some(_) => {}
                    None => {
                        table.insert(key, value.canonical_id);
                    }
                }
            }
        }

        Ok(Self { terms, tables })
    }

    pub fn resolve(&self, field: VocabularyField, provider_id: ProviderId, raw: &str) -> Resolution {
        let key = normalize(raw);
        let id = [Some(provider_id), None].into_iter().find_map(|provider| {
            self.tables
                .get(&(field, provider))
                .and_then(|table| table.get(&key))
        });

        match id.and_then(|id| self.terms.get(&(field, *id))) {
            Some(value) => Resolution::Resolved(value.clone()),
            None => Resolution::Unresolved(raw.to_string()),
        }
    }

    /// Canonical term by id, used when a source already delivers canonical ids.
    pub fn term(&self, field: VocabularyField, id: i32) -> Option<&VocabularyValue> {
        self.terms.get(&(field, id))
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sex_vocabulary() -> Vocabulary {
        Vocabulary {
            field: VocabularyField::Sex,
            values: vec![
                VocabularyValue { id: 1, value: "male".into() },
                VocabularyValue { id: 2, value: "female".into() },
            ],
        }
    }

    fn mapping(provider_id: Option<ProviderId>, values: &[(&str, i32)]) -> ExternalSystemMapping {
        ExternalSystemMapping {
            field: VocabularyField::Sex,
            provider_id,
            values: values
                .iter()
                .map(|(raw, id)| MappingValue { raw: raw.to_string(), canonical_id: *id })
                .collect(),
        }
    }

    #[test]
    fn test_resolve_provider_then_shared_table() {
        let resolver = VocabularyResolver::load(
            vec![sex_vocabulary()],
            vec![mapping(Some(1), &[("hane", 1)]), mapping(None, &[("F", 2), ("M", 1)])],
        )
        .unwrap();

        assert_eq!(
            resolver.resolve(VocabularyField::Sex, 1, " Hane "),
            Resolution::Resolved(VocabularyValue { id: 1, value: "male".into() })
        );
        assert_eq!(
            resolver.resolve(VocabularyField::Sex, 7, "f"),
            Resolution::Resolved(VocabularyValue { id: 2, value: "female".into() })
        );
        // provider 7 has no "hane" mapping
        assert_eq!(
            resolver.resolve(VocabularyField::Sex, 7, "hane"),
            Resolution::Unresolved("hane".into())
        );
        assert!(!resolver.resolve(VocabularyField::LifeStage, 1, "adult").is_resolved());
    }

    #[test]
    fn test_duplicate_mapping_is_rejected() {
        let err = VocabularyResolver::load(
            vec![sex_vocabulary()],
            vec![mapping(Some(3), &[("m", 1), ("M ", 2)])],
        )
        .unwrap_err();
        assert_eq!(
            err,
            VocabularyError::DuplicateMapping(DuplicateMappingError {
                field: VocabularyField::Sex,
                provider_id: Some(3),
                raw: "M ".into(),
                first_id: 1,
                second_id: 2,
            })
        );
        assert!(err.to_string().contains("provider 3"));
    }

    #[test]
    fn test_repeated_identical_mapping_is_accepted() {
        let resolver = VocabularyResolver::load(
            vec![sex_vocabulary()],
            vec![mapping(None, &[("m", 1)]), mapping(None, &[("M", 1)])],
        );
        assert!(resolver.is_ok());
    }

    #[test]
    fn test_unknown_canonical_id_is_rejected() {
        let err = VocabularyResolver::load(vec![sex_vocabulary()], vec![mapping(None, &[("x", 9)])])
            .unwrap_err();
        assert_eq!(
            err,
            VocabularyError::UnknownVocabularyId { field: VocabularyField::Sex, id: 9 }
        );
    }

    #[test]
    fn test_unresolved_term_keeps_raw_text() {
        let term = VocabularyTerm::from(Resolution::Unresolved("Juvenil?".into()));
        assert_eq!(term, VocabularyTerm { id: None, value: "Juvenil?".into() });
    }
}
