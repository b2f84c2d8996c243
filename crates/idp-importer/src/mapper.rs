//! Mapping and validation of raw records
//!
//! The mapper turns one `RawRecord` into a normalized `TargetRecord` with
//! a stable `RecordId`, or into a mapping failure naming the source row.
//! Rules run in order: required fields present, types coerce, then the
//! geographic code resolves against the reference dataset. A failing
//! record never aborts the run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::RawRecord;
use crate::attrs::AttributeValue;
use crate::config::{ImportType, ImporterConfig};
use crate::reference::ReferenceDataset;

/// Target fields with dedicated handling for indicator imports
const RESERVED_TARGETS: &[&str] = &["geography_code", "indicator_code", "period", "value"];

/// Stable record key derived from a record's natural key
///
/// Repeated runs and resumes derive the same id for the same record, which
/// is what makes target writes idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Derive an id by hashing the natural key parts
    pub fn from_natural_key<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hasher = Sha256::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an id read back from a store
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized record ready for staging and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub key: RecordId,
    pub kind: ImportType,
    pub geography_id: Uuid,
    pub indicator: Option<String>,
    pub period: Option<String>,
    pub value: Option<f64>,
    /// Remaining mapped fields (and serialized geometry where present)
    pub data: Value,
}

/// Why one record was rejected; becomes a `RecordFailure` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapError {
    pub row: String,
    pub reason: String,
}

impl MapError {
    fn new(raw: &RawRecord, reason: impl Into<String>) -> Self {
        Self {
            row: format!("row {}", raw.row),
            reason: reason.into(),
        }
    }
}

/// Maps raw records for one importer
pub struct RecordMapper {
    import_type: ImportType,
    mappings: Vec<(String, String)>,
    admin_code_type: String,
    date_format: Option<String>,
    key_fields: Vec<String>,
    default_indicator: Option<String>,
    reference: Arc<dyn ReferenceDataset>,
}

impl RecordMapper {
    pub fn for_importer(config: &ImporterConfig, reference: Arc<dyn ReferenceDataset>) -> Self {
        let default_indicator = match config.attributes.get("indicator") {
            Some(AttributeValue::Text(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };

        Self {
            import_type: config.import_type,
            mappings: config
                .mappings
                .iter()
                .map(|(s, t)| (s.clone(), t.clone()))
                .collect(),
            admin_code_type: config.admin_code_type.clone(),
            date_format: config.date_format.clone(),
            key_fields: config.key_fields.clone(),
            default_indicator,
            reference,
        }
    }

    /// Map and validate one raw record
    pub fn map(&self, raw: &RawRecord) -> Result<TargetRecord, MapError> {
        let geo_code = self
            .mapped_text(raw, "geography_code")
            .ok_or_else(|| MapError::new(raw, "missing geography code"))?;

        let (indicator, period, value) = match self.import_type {
            ImportType::IndicatorValue => {
                let indicator = self
                    .mapped_text(raw, "indicator_code")
                    .or_else(|| self.default_indicator.clone())
                    .ok_or_else(|| MapError::new(raw, "missing indicator code"))?;

                let period_raw = self
                    .mapped_text(raw, "period")
                    .ok_or_else(|| MapError::new(raw, "missing period"))?;
                let period = coerce_period(&period_raw, self.date_format.as_deref())
                    .map_err(|reason| MapError::new(raw, reason))?;

                let value_raw = self
                    .mapped_text(raw, "value")
                    .ok_or_else(|| MapError::new(raw, "missing value"))?;
                let value =
                    coerce_number(&value_raw).map_err(|reason| MapError::new(raw, reason))?;

                (Some(indicator), Some(period), Some(value))
            },
            ImportType::RelatedTable => (None, None, None),
        };

        let geography = self
            .reference
            .resolve(&self.admin_code_type, &geo_code)
            .ok_or_else(|| {
                MapError::new(
                    raw,
                    format!(
                        "unresolved {} code '{}'",
                        self.admin_code_type, geo_code
                    ),
                )
            })?;

        let data = self.collect_data(raw);
        let key = self.record_key(&geography.id, indicator.as_deref(), period.as_deref(), &data);

        Ok(TargetRecord {
            key,
            kind: self.import_type,
            geography_id: geography.id,
            indicator,
            period,
            value,
            data,
        })
    }

    /// Mapped field as text: first configured source with a value, falling
    /// back to a raw field literally named like the target (how unpivoted
    /// wide sources deliver `period`/`value`)
    fn mapped_text(&self, raw: &RawRecord, target: &str) -> Option<String> {
        for (source, mapped_target) in &self.mappings {
            if mapped_target == target {
                if let Some(text) = raw.get_text(source) {
                    return Some(text);
                }
            }
        }
        raw.get_text(target)
    }

    /// Mapped fields outside the reserved set, keyed by target name
    fn collect_data(&self, raw: &RawRecord) -> Value {
        let mut data = serde_json::Map::new();
        for (source, target) in &self.mappings {
            if RESERVED_TARGETS.contains(&target.as_str()) {
                continue;
            }
            if let Some(value) = raw.get(source) {
                if !value.is_null() {
                    data.insert(target.clone(), value.clone());
                }
            }
        }
        Value::Object(data)
    }

    fn record_key(
        &self,
        geography_id: &Uuid,
        indicator: Option<&str>,
        period: Option<&str>,
        data: &Value,
    ) -> RecordId {
        let geo = geography_id.to_string();
        match self.import_type {
            ImportType::IndicatorValue => RecordId::from_natural_key([
                self.import_type.as_str(),
                indicator.unwrap_or_default(),
                geo.as_str(),
                period.unwrap_or_default(),
            ]),
            ImportType::RelatedTable => {
                if self.key_fields.is_empty() {
                    let serialized = data.to_string();
                    RecordId::from_natural_key([
                        self.import_type.as_str(),
                        geo.as_str(),
                        serialized.as_str(),
                    ])
                } else {
                    let mut parts = vec![
                        self.import_type.as_str().to_string(),
                        geo.clone(),
                    ];
                    for field in &self.key_fields {
                        let part = data
                            .get(field)
                            .map(|v| match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default();
                        parts.push(part);
                    }
                    RecordId::from_natural_key(parts.iter().map(String::as_str))
                }
            },
        }
    }
}

/// Parse a numeric value, tolerating digit grouping and whitespace
fn coerce_number(text: &str) -> Result<f64, String> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '\u{a0}'))
        .collect();
    cleaned
        .parse::<f64>()
        .map_err(|_| format!("'{text}' is not a number"))
}

/// Normalize a period: with a configured date format, parse and emit ISO
/// dates; otherwise pass the label through
fn coerce_period(text: &str, date_format: Option<&str>) -> Result<String, String> {
    match date_format {
        Some(format) => chrono::NaiveDate::parse_from_str(text, format)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .map_err(|_| format!("'{text}' does not match date format '{format}'")),
        None => Ok(text.trim().to_string()),
    }
}
