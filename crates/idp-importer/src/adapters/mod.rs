//! Format adapters
//!
//! Each supported input format has one adapter implementing
//! [`FormatAdapter`]: it declares the attributes it needs and turns the
//! configured external source into a lazy stream of raw records. Adapters
//! are selected through [`adapter_for`], a registry keyed by
//! [`InputFormat`].

pub mod api_geo;
pub mod csv_http;
pub mod excel;
pub mod related;
pub mod sdmx;
pub mod sharepoint;
pub mod tabular;
pub mod vector;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::attrs::AttributeStore;
pub use crate::attrs::{AttributeKind, AttributeSpec};
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::Result;

pub use api_geo::ApiGeographyAdapter;
pub use csv_http::CsvHttpAdapter;
pub use excel::ExcelAdapter;
pub use related::RelatedTableAdapter;
pub use sdmx::SdmxAdapter;
pub use sharepoint::SharePointAdapter;
pub use vector::VectorLayerAdapter;

/// One record as read from the source, keyed by source column names
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Source row reference (1-based where the source has rows)
    pub row: u64,
    pub fields: BTreeMap<String, Value>,
}

impl RawRecord {
    pub fn new(row: u64) -> Self {
        Self {
            row,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field as trimmed text, if present and non-empty
    pub fn get_text(&self, name: &str) -> Option<String> {
        let value = self.fields.get(name)?;
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => return None,
            other => other.to_string(),
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Lazy record stream plus extraction metadata
pub struct Extraction {
    pub records: BoxStream<'static, Result<RawRecord>>,
    /// Source row count when the source reports one up front
    pub source_rows: Option<u64>,
}

impl Extraction {
    /// Extraction over an already-materialized set of records
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        let source_rows = Some(records.len() as u64);
        Self {
            records: Box::pin(futures::stream::iter(records.into_iter().map(Ok))),
            source_rows,
        }
    }
}

/// Strategy for reading one external input format
#[async_trait]
pub trait FormatAdapter: Send + Sync {
    /// The format this adapter serves
    fn input_format(&self) -> InputFormat;

    /// Ordered list of attributes this adapter reads
    fn declare_schema(&self) -> Vec<AttributeSpec>;

    /// Produce the record stream from the configured source
    ///
    /// # Errors
    ///
    /// `Configuration` for missing/invalid attributes, `SourceUnavailable`
    /// for network/auth failures, `Format` for malformed payloads,
    /// `Timeout` when the fetch budget elapses. All are fatal to the
    /// attempt.
    async fn extract(&self, attrs: &AttributeStore, staging: &Staging) -> Result<Extraction>;
}

/// Registry lookup: the adapter serving an input format
pub fn adapter_for(format: InputFormat) -> Box<dyn FormatAdapter> {
    match format {
        InputFormat::ExcelWide | InputFormat::ExcelLong => Box::new(ExcelAdapter::new(format)),
        InputFormat::SharePointWide | InputFormat::SharePointLong => {
            Box::new(SharePointAdapter::new(format))
        },
        InputFormat::ApiGeographyWide | InputFormat::ApiGeographyLong => {
            Box::new(ApiGeographyAdapter::new(format))
        },
        InputFormat::VectorLayer => Box::new(VectorLayerAdapter::new()),
        InputFormat::RelatedTable => Box::new(RelatedTableAdapter::new()),
        InputFormat::Sdmx => Box::new(SdmxAdapter::new()),
        InputFormat::CsvHttp => Box::new(CsvHttpAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_registry_covers_every_format() {
        for format in InputFormat::all() {
            let adapter = adapter_for(*format);
            assert_eq!(adapter.input_format(), *format, "{format:?}");
            assert!(
                !adapter.declare_schema().is_empty(),
                "{format:?} declares no attributes"
            );
        }
    }

    #[test]
    fn test_raw_record_get_text() {
        let record = RawRecord::new(1)
            .with_field("name", Value::String("  Nairobi  ".into()))
            .with_field("count", serde_json::json!(42))
            .with_field("empty", Value::String("".into()))
            .with_field("missing_value", Value::Null);

        assert_eq!(record.get_text("name").as_deref(), Some("Nairobi"));
        assert_eq!(record.get_text("count").as_deref(), Some("42"));
        assert_eq!(record.get_text("empty"), None);
        assert_eq!(record.get_text("missing_value"), None);
        assert_eq!(record.get_text("absent"), None);
    }

    #[tokio::test]
    async fn test_extraction_from_records() {
        let records = vec![RawRecord::new(1), RawRecord::new(2)];
        let extraction = Extraction::from_records(records);
        assert_eq!(extraction.source_rows, Some(2));

        let collected: Vec<_> = extraction.records.collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(|r| r.is_ok()));
    }
}
