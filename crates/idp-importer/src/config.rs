//! Importer configuration
//!
//! `ImporterConfig` is the admin-managed definition of one import source,
//! read from the store at run start. `EngineConfig` is the process-level
//! tuning loaded from `IMPORTER_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::attrs::AttributeValue;
use crate::models::AlertRule;

/// What kind of target records an importer produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportType {
    IndicatorValue,
    RelatedTable,
}

impl ImportType {
    pub fn as_str(&self) -> &str {
        match self {
            ImportType::IndicatorValue => "indicator_value",
            ImportType::RelatedTable => "related_table",
        }
    }
}

impl From<String> for ImportType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "related_table" => ImportType::RelatedTable,
            _ => ImportType::IndicatorValue,
        }
    }
}

/// Input format, selecting one concrete format adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    ExcelWide,
    ExcelLong,
    SharePointWide,
    SharePointLong,
    ApiGeographyWide,
    ApiGeographyLong,
    VectorLayer,
    RelatedTable,
    Sdmx,
    CsvHttp,
}

impl InputFormat {
    pub fn as_str(&self) -> &str {
        match self {
            InputFormat::ExcelWide => "excel_wide",
            InputFormat::ExcelLong => "excel_long",
            InputFormat::SharePointWide => "share_point_wide",
            InputFormat::SharePointLong => "share_point_long",
            InputFormat::ApiGeographyWide => "api_geography_wide",
            InputFormat::ApiGeographyLong => "api_geography_long",
            InputFormat::VectorLayer => "vector_layer",
            InputFormat::RelatedTable => "related_table",
            InputFormat::Sdmx => "sdmx",
            InputFormat::CsvHttp => "csv_http",
        }
    }

    /// All formats, in registry order
    pub fn all() -> &'static [InputFormat] {
        &[
            InputFormat::ExcelWide,
            InputFormat::ExcelLong,
            InputFormat::SharePointWide,
            InputFormat::SharePointLong,
            InputFormat::ApiGeographyWide,
            InputFormat::ApiGeographyLong,
            InputFormat::VectorLayer,
            InputFormat::RelatedTable,
            InputFormat::Sdmx,
            InputFormat::CsvHttp,
        ]
    }
}

impl std::str::FromStr for InputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InputFormat::all()
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Invalid input format: {}", s))
    }
}

/// Admin-managed definition of one import source
///
/// Owned by the external configuration UI; the engine treats it as
/// read-only from run start to finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImporterConfig {
    pub id: Uuid,
    pub name: String,
    pub import_type: ImportType,
    pub input_format: InputFormat,
    /// Named administrative hierarchy used to resolve geographic codes
    pub reference_dataset: Option<String>,
    /// Which code scheme source geographies are expressed in
    pub admin_code_type: String,
    /// Cron text owned by the external scheduler; informational here
    pub schedule: Option<String>,
    /// Whether the admin UI queues a run immediately after creation
    pub run_on_create: bool,
    /// Adapter configuration (credentials, URLs, staged files)
    pub attributes: BTreeMap<String, AttributeValue>,
    /// source field -> target field
    pub mappings: BTreeMap<String, String>,
    /// Natural-key columns for related-table imports; empty means the
    /// whole row is the key
    #[serde(default)]
    pub key_fields: Vec<String>,
    /// Date parse format for period fields (chrono syntax)
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
}

impl ImporterConfig {
    /// The target field a source field maps to, if mapped
    pub fn target_field(&self, source: &str) -> Option<&str> {
        self.mappings.get(source).map(String::as_str)
    }

    /// Source fields that map to a given target field
    pub fn sources_for(&self, target: &str) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|(_, t)| t.as_str() == target)
            .map(|(s, _)| s.as_str())
            .collect()
    }
}

/// Process-level engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Records per persistence batch
    pub batch_size: usize,
    /// Attempts per batch before its ids are recorded in the checkpoint note
    pub max_retries: u32,
    /// Base backoff between batch retries; doubles per attempt
    pub retry_backoff_ms: u64,
    /// Budget for the whole extraction call
    pub fetch_timeout_secs: u64,
    /// Budget for one batch write
    pub write_timeout_secs: u64,
    /// Directory where remote payloads are staged
    pub staging_dir: PathBuf,
    /// Staged payloads older than this are re-fetched
    pub staging_max_age_secs: u64,
    /// Interval of the incomplete-checkpoint resume sweep
    pub resume_interval_secs: u64,
}

impl EngineConfig {
    /// Load engine configuration from `IMPORTER_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            batch_size: env_parse("IMPORTER_BATCH_SIZE", defaults.batch_size),
            max_retries: env_parse("IMPORTER_MAX_RETRIES", defaults.max_retries),
            retry_backoff_ms: env_parse("IMPORTER_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            fetch_timeout_secs: env_parse(
                "IMPORTER_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout_secs,
            ),
            write_timeout_secs: env_parse(
                "IMPORTER_WRITE_TIMEOUT_SECS",
                defaults.write_timeout_secs,
            ),
            staging_dir: std::env::var("IMPORTER_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            staging_max_age_secs: env_parse(
                "IMPORTER_STAGING_MAX_AGE_SECS",
                defaults.staging_max_age_secs,
            ),
            resume_interval_secs: env_parse(
                "IMPORTER_RESUME_INTERVAL_SECS",
                defaults.resume_interval_secs,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("IMPORTER_BATCH_SIZE must be greater than 0");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("IMPORTER_FETCH_TIMEOUT_SECS must be greater than 0");
        }
        if self.write_timeout_secs == 0 {
            anyhow::bail!("IMPORTER_WRITE_TIMEOUT_SECS must be greater than 0");
        }
        if self.resume_interval_secs == 0 {
            anyhow::bail!("IMPORTER_RESUME_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Backoff before the given (1-based) retry attempt
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms << attempt.saturating_sub(1).min(8))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff_ms: 250,
            fetch_timeout_secs: 300,
            write_timeout_secs: 60,
            staging_dir: std::env::temp_dir().join("idp-importer-staging"),
            staging_max_age_secs: 86_400,
            resume_interval_secs: 300,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_format_round_trip() {
        for format in InputFormat::all() {
            assert_eq!(format.as_str().parse::<InputFormat>().unwrap(), *format);
        }
        assert!("unknown".parse::<InputFormat>().is_err());
    }

    #[test]
    fn test_import_type_from_string() {
        assert_eq!(
            ImportType::from("related_table".to_string()),
            ImportType::RelatedTable
        );
        assert_eq!(
            ImportType::from("indicator_value".to_string()),
            ImportType::IndicatorValue
        );
    }

    #[test]
    fn test_engine_config_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_engine_config_validation_zero_batch() {
        let mut config = EngineConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_validation_zero_timeouts() {
        let mut config = EngineConfig::default();
        config.write_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fetch_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_backoff(1), Duration::from_millis(250));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(500));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_mapping_lookups() {
        let mut mappings = BTreeMap::new();
        mappings.insert("GEO".to_string(), "geography_code".to_string());
        mappings.insert("AREA".to_string(), "geography_code".to_string());

        let config = ImporterConfig {
            id: Uuid::new_v4(),
            name: "test".into(),
            import_type: ImportType::IndicatorValue,
            input_format: InputFormat::CsvHttp,
            reference_dataset: None,
            admin_code_type: "pcode".into(),
            schedule: None,
            run_on_create: false,
            attributes: BTreeMap::new(),
            mappings,
            key_fields: Vec::new(),
            date_format: None,
            alerts: Vec::new(),
        };

        assert_eq!(config.target_field("GEO"), Some("geography_code"));
        assert_eq!(config.target_field("missing"), None);
        assert_eq!(config.sources_for("geography_code").len(), 2);
    }
}
