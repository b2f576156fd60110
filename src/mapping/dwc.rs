use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::FieldSource;

/// One Darwin Core occurrence row keyed by term. Keys may be bare term names
/// (`decimalLatitude`), prefixed (`dwc:decimalLatitude`) or full term URIs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DwcRecord {
    pub terms: BTreeMap<String, String>,
}

impl DwcRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, term: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.insert(term.into(), value.into());
        self
    }

    pub fn get(&self, term: &str) -> Option<&str> {
        if let Some(value) = self.terms.get(term) {
            return Some(value.as_str());
        }
        self.terms
            .iter()
            .find(|(key, _)| {
                key.rsplit(|c| c == '/' || c == ':' || c == '#')
                    .next()
                    .is_some_and(|local| local.eq_ignore_ascii_case(term))
            })
            .map(|(_, value)| value.as_str())
    }
}

impl FieldSource for DwcRecord {
    fn text(&self, column: &str) -> Option<String> {
        self.get(column)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}
