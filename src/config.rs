use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::area::AreaType;
use crate::geometry::Coordinate;
use crate::mapping::MappingDescriptor;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HarvesterConfig {
    #[serde(default)]
    pub harvest: HarvestSettings,
    #[serde(default)]
    pub sensitivity: SensitivitySettings,
    #[serde(default)]
    pub areas: AreaSettings,
    #[serde(default)]
    pub providers: Vec<MappingDescriptor>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Stop a run once this many source records were pulled.
    #[serde(default)]
    pub max_records: Option<usize>,
    /// Minimum time between the starts of two connector calls.
    #[serde(default)]
    pub min_call_interval_ms: u64,
    #[serde(default = "default_max_concurrent_providers")]
    pub max_concurrent_providers: usize,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_records: None,
            min_call_interval_ms: 0,
            max_concurrent_providers: default_max_concurrent_providers(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_max_concurrent_providers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensitivitySettings {
    /// Minimum public distance per category, index 0 being category 1.
    #[serde(default = "default_category_buffers")]
    pub category_buffers_m: Vec<u32>,
    #[serde(default = "default_max_generalized_category")]
    pub max_generalized_category: u8,
    #[serde(default = "default_grid_origin")]
    pub grid_origin: Coordinate,
}

impl Default for SensitivitySettings {
    fn default() -> Self {
        Self {
            category_buffers_m: default_category_buffers(),
            max_generalized_category: default_max_generalized_category(),
            grid_origin: default_grid_origin(),
        }
    }
}

fn default_category_buffers() -> Vec<u32> {
    vec![1000, 5000, 25000, 50000]
}
fn default_max_generalized_category() -> u8 {
    4
}
fn default_grid_origin() -> Coordinate {
    Coordinate::new(0.0, 0.0)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AreaSettings {
    /// Extra reach, beyond the coordinate uncertainty, for nearest-area
    /// fallback lookups.
    #[serde(default = "default_nearest_tolerance")]
    pub nearest_area_tolerance_m: u32,
    /// Area types every record is expected to be assigned to.
    #[serde(default = "default_required_types")]
    pub required_types: Vec<AreaType>,
}

impl Default for AreaSettings {
    fn default() -> Self {
        Self {
            nearest_area_tolerance_m: default_nearest_tolerance(),
            required_types: default_required_types(),
        }
    }
}

fn default_nearest_tolerance() -> u32 {
    1000
}
fn default_required_types() -> Vec<AreaType> {
    vec![AreaType::County, AreaType::Municipality, AreaType::Province]
}

impl HarvesterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.harvest.batch_size == 0 {
            return Err(ConfigError::Invalid("harvest.batch_size must be > 0".into()));
        }
        if self.harvest.max_concurrent_providers == 0 {
            return Err(ConfigError::Invalid(
                "harvest.max_concurrent_providers must be > 0".into(),
            ));
        }

        let buffers = &self.sensitivity.category_buffers_m;
        if buffers.iter().any(|&b| b == 0) {
            return Err(ConfigError::Invalid(
                "sensitivity.category_buffers_m must all be > 0".into(),
            ));
        }
        if buffers.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::Invalid(
                "sensitivity.category_buffers_m must not decrease with category".into(),
            ));
        }
        if usize::from(self.sensitivity.max_generalized_category) > buffers.len() {
            return Err(ConfigError::Invalid(format!(
                "sensitivity.max_generalized_category is {} but only {} buffers are configured",
                self.sensitivity.max_generalized_category,
                buffers.len()
            )));
        }
        if !self.sensitivity.grid_origin.is_valid() {
            return Err(ConfigError::Invalid(
                "sensitivity.grid_origin is not a valid coordinate".into(),
            ));
        }

        let mut seen = HashSet::new();
        for descriptor in &self.providers {
            if !seen.insert(descriptor.provider_id) {
                return Err(ConfigError::Invalid(format!(
                    "provider {} is configured more than once",
                    descriptor.provider_id
                )));
            }
            descriptor
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        Ok(())
    }

    pub fn provider(&self, provider_id: crate::model::ProviderId) -> Option<&MappingDescriptor> {
        self.providers.iter().find(|p| p.provider_id == provider_id)
    }
}

pub fn parse_config(content: &str) -> Result<HarvesterConfig, ConfigError> {
    let config: HarvesterConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<HarvesterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::SourceKind;
    use std::io::Write;

    const SAMPLE: &str = r#"
[harvest]
batch_size = 500
max_records = 20000
min_call_interval_ms = 2000

[sensitivity]
category_buffers_m = [1000, 5000, 25000]
max_generalized_category = 3

[areas]
required_types = ["county", "municipality"]

[[providers]]
provider_id = 1
name = "Bird reports"
dataset_id = "birds-2024"
namespace = "birds.example.org"
kind = "darwin_core"
extension_fields = ["habitat"]

[[providers]]
provider_id = 2
name = "Fish survey database"
dataset_id = "fish"
namespace = "fish.example.org"
kind = "tabular"
coordinate_required = false

[providers.columns]
source_id = "ObsId"
taxon_id = "DyntaxaId"
latitude = "Lat"
longitude = "Lon"
event_date = "SurveyDate"
"#;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.harvest.batch_size, 500);
        assert_eq!(config.harvest.max_records, Some(20000));
        assert_eq!(config.harvest.min_call_interval_ms, 2000);
        assert_eq!(config.harvest.max_concurrent_providers, 4);
        assert_eq!(config.sensitivity.max_generalized_category, 3);
        assert_eq!(
            config.areas.required_types,
            vec![AreaType::County, AreaType::Municipality]
        );
        assert_eq!(config.areas.nearest_area_tolerance_m, 1000);

        let fish = config.provider(2).unwrap();
        assert_eq!(fish.kind, SourceKind::Tabular);
        assert!(!fish.coordinate_required);
        assert_eq!(fish.columns.source_id, "ObsId");
        // unspecified columns keep their Darwin Core defaults
        assert_eq!(fish.columns.recorded_by, "recordedBy");

        let birds = config.provider(1).unwrap();
        assert!(birds.coordinate_required);
        assert_eq!(birds.extension_fields, vec!["habitat".to_string()]);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse_config("").unwrap();
        assert_eq!(config.harvest.batch_size, 1000);
        assert_eq!(config.sensitivity.category_buffers_m, vec![1000, 5000, 25000, 50000]);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(matches!(
            parse_config("[harvest]\nbatch_size = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("[sensitivity]\ncategory_buffers_m = [5000, 1000]\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("[sensitivity]\ncategory_buffers_m = [1000]\nmax_generalized_category = 2\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(parse_config("harvest = 3"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_rejects_duplicate_provider() {
        let doc = r#"
[[providers]]
provider_id = 1
name = "a"
dataset_id = "a"
namespace = "a.example.org"
kind = "structured"

[[providers]]
provider_id = 1
name = "b"
dataset_id = "b"
namespace = "b.example.org"
kind = "structured"
"#;
        let err = parse_config(doc).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/harvester.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
