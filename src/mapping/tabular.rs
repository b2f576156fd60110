use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{parse_interval, FieldSource};

/// A typed cell as delivered by a relational source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub columns: BTreeMap<String, CellValue>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.columns.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns.get(column)
    }
}

impl FieldSource for SourceRow {
    fn text(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::Integer(n) => Some(n.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Text(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            CellValue::Timestamp(t) => Some(t.to_rfc3339()),
        }
    }

    fn float(&self, column: &str) -> Result<Option<f64>, String> {
        match self.get(column) {
            None | Some(CellValue::Null) => Ok(None),
            Some(CellValue::Integer(n)) => Ok(Some(*n as f64)),
            Some(CellValue::Float(f)) if f.is_finite() => Ok(Some(*f)),
            Some(CellValue::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(CellValue::Text(s)) => s
                .trim()
                .replace(',', ".")
                .parse()
                .map(Some)
                .map_err(|_| s.clone()),
            Some(_) => Err(self.text(column).unwrap_or_default()),
        }
    }

    fn boolean(&self, column: &str) -> Result<Option<bool>, String> {
        match self.get(column) {
            None | Some(CellValue::Null) => Ok(None),
            Some(CellValue::Bool(b)) => Ok(Some(*b)),
            Some(CellValue::Integer(0)) => Ok(Some(false)),
            Some(CellValue::Integer(1)) => Ok(Some(true)),
            Some(CellValue::Text(_)) => match self.text(column) {
                None => Ok(None),
                Some(raw) => match raw.to_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Some(true)),
                    "false" | "no" | "0" => Ok(Some(false)),
                    _ => Err(raw),
                },
            },
            Some(_) => Err(self.text(column).unwrap_or_default()),
        }
    }

    fn integer(&self, column: &str) -> Result<Option<i64>, String> {
        match self.get(column) {
            None | Some(CellValue::Null) => Ok(None),
            Some(CellValue::Integer(n)) => Ok(Some(*n)),
            Some(CellValue::Float(f)) if f.fract() == 0.0 && f.is_finite() => Ok(Some(*f as i64)),
            Some(CellValue::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(CellValue::Text(s)) => s.trim().parse().map(Some).map_err(|_| s.clone()),
            Some(_) => Err(self.text(column).unwrap_or_default()),
        }
    }

    fn timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, String> {
        match self.get(column) {
            Some(CellValue::Timestamp(t)) => Ok(Some(*t)),
            _ => self
                .interval(column)
                .map(|interval| interval.map(|(start, _)| start)),
        }
    }

    fn interval(&self, column: &str) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, String> {
        match self.get(column) {
            Some(CellValue::Timestamp(t)) => Ok(Some((*t, *t))),
            _ => match self.text(column) {
                None => Ok(None),
                Some(raw) => parse_interval(&raw).map(Some).ok_or(raw),
            },
        }
    }

    fn json(&self, column: &str) -> Option<serde_json::Value> {
        match self.get(column)? {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(serde_json::Value::Bool(*b)),
            CellValue::Integer(n) => Some(serde_json::Value::from(*n)),
            CellValue::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
            CellValue::Text(_) | CellValue::Timestamp(_) => {
                self.text(column).map(serde_json::Value::String)
            }
        }
    }
}
