//! Generic CSV-over-HTTP adapter
//!
//! Downloads a delimited file once into staging and reads it as a long
//! table: one raw record per row, keyed by the header row.

use serde_json::Value;
use std::path::Path;

use async_trait::async_trait;

use super::tabular::{SheetLayout, Table};
use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::{ImportError, Result};

pub struct CsvHttpAdapter;

impl CsvHttpAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CsvHttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormatAdapter for CsvHttpAdapter {
    fn input_format(&self) -> InputFormat {
        InputFormat::CsvHttp
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        vec![
            AttributeSpec::required("url", AttributeKind::Text),
            AttributeSpec::optional("delimiter", AttributeKind::Text),
        ]
    }

    async fn extract(&self, attrs: &AttributeStore, staging: &Staging) -> Result<Extraction> {
        let url = attrs.require_text("url")?;
        let delimiter = parse_delimiter(attrs.get_text("delimiter"))?;

        let client = reqwest::Client::new();
        let path = staging.fetch_or_reuse(client.get(url), url, "csv").await?;

        let table = Table::from_rows(read_delimited_rows(&path, delimiter)?)?;
        Ok(Extraction::from_records(
            table.into_records(SheetLayout::Long, &[]),
        ))
    }
}

/// Resolve the optional single-character delimiter attribute
pub(crate) fn parse_delimiter(attr: Option<&str>) -> Result<u8> {
    match attr {
        None => Ok(b','),
        Some("\\t") | Some("tab") => Ok(b'\t'),
        Some(s) if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        Some(s) => Err(ImportError::Configuration(format!(
            "delimiter must be one ASCII character, got '{s}'"
        ))),
    }
}

/// Read a delimited file into raw rows (header included)
pub(crate) fn read_delimited_rows(path: &Path, delimiter: u8) -> Result<Vec<Vec<Value>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_path(path)
        .map_err(|e| ImportError::Format(format!("cannot open delimited file: {e}")))?;

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| ImportError::Format(format!("bad delimited row: {e}")))?;
        rows.push(
            record
                .iter()
                .map(|cell| Value::String(cell.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttributeValue;
    use futures::StreamExt;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn staging() -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path(), Duration::from_secs(300));
        (dir, staging)
    }

    fn attrs_for(url: String) -> AttributeStore {
        let mut attrs = AttributeStore::default();
        attrs.set("url", AttributeValue::Text(url));
        attrs
    }

    #[test]
    fn test_parse_delimiter() {
        assert_eq!(parse_delimiter(None).unwrap(), b',');
        assert_eq!(parse_delimiter(Some(";")).unwrap(), b';');
        assert_eq!(parse_delimiter(Some("tab")).unwrap(), b'\t');
        assert!(parse_delimiter(Some("||")).is_err());
    }

    #[tokio::test]
    async fn test_extract_downloads_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/export.csv"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("geo,period,value\nKE-001,2021,10\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, staging) = staging();
        let adapter = CsvHttpAdapter::new();
        let attrs = attrs_for(format!("{}/export.csv", server.uri()));

        let extraction = adapter.extract(&attrs, &staging).await.unwrap();
        assert_eq!(extraction.source_rows, Some(1));

        let records: Vec<_> = extraction.records.collect().await;
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.get_text("geo").as_deref(), Some("KE-001"));
        assert_eq!(record.get_text("value").as_deref(), Some("10"));

        // A second extraction reuses the staged copy, hence expect(1)
        let extraction = adapter.extract(&attrs, &staging).await.unwrap();
        assert_eq!(extraction.source_rows, Some(1));
    }

    #[tokio::test]
    async fn test_extract_http_error_is_source_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (_dir, staging) = staging();
        let adapter = CsvHttpAdapter::new();
        let attrs = attrs_for(format!("{}/export.csv", server.uri()));

        let err = adapter.extract(&attrs, &staging).await.unwrap_err();
        assert!(matches!(err, ImportError::SourceUnavailable(_)), "{err}");
    }
}
