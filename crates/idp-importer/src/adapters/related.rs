//! Related-table adapter
//!
//! Reads an arbitrary delimited table whose rows attach to geographies.
//! The payload comes either from an uploaded file attribute or from a URL;
//! row semantics beyond the geography key are owned by the field mapping.

use async_trait::async_trait;

use super::csv_http::{parse_delimiter, read_delimited_rows};
use super::tabular::{SheetLayout, Table};
use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::{ImportError, Result};

pub struct RelatedTableAdapter;

impl RelatedTableAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RelatedTableAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormatAdapter for RelatedTableAdapter {
    fn input_format(&self) -> InputFormat {
        InputFormat::RelatedTable
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        vec![
            AttributeSpec::optional("table_file", AttributeKind::File),
            AttributeSpec::optional("url", AttributeKind::Text),
            AttributeSpec::optional("delimiter", AttributeKind::Text),
        ]
    }

    async fn extract(&self, attrs: &AttributeStore, staging: &Staging) -> Result<Extraction> {
        let delimiter = parse_delimiter(attrs.get_text("delimiter"))?;

        let path = match (attrs.get_file("table_file"), attrs.get_text("url")) {
            (Some(path), _) => {
                if !path.exists() {
                    return Err(ImportError::Configuration(format!(
                        "table file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            },
            (None, Some(url)) => {
                let client = reqwest::Client::new();
                staging.fetch_or_reuse(client.get(url), url, "csv").await?
            },
            (None, None) => {
                return Err(ImportError::Configuration(
                    "related table needs a 'table_file' or 'url' attribute".into(),
                ))
            },
        };

        let table = Table::from_rows(read_delimited_rows(&path, delimiter)?)?;
        Ok(Extraction::from_records(
            table.into_records(SheetLayout::Long, &[]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttributeValue;
    use futures::StreamExt;
    use std::time::Duration;

    fn staging() -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path(), Duration::from_secs(60));
        (dir, staging)
    }

    #[tokio::test]
    async fn test_extract_from_uploaded_file() {
        let (_dir, staging) = staging();
        let data_dir = tempfile::tempdir().unwrap();
        let path = data_dir.path().join("facilities.csv");
        std::fs::write(&path, "geo,facility,beds\nKE-001,Clinic A,12\nKE-002,Clinic B,8\n")
            .unwrap();

        let mut attrs = AttributeStore::default();
        attrs.set("table_file", AttributeValue::FileRef(path));

        let adapter = RelatedTableAdapter::new();
        let extraction = adapter.extract(&attrs, &staging).await.unwrap();
        assert_eq!(extraction.source_rows, Some(2));

        let records: Vec<_> = extraction.records.collect().await;
        let record = records[1].as_ref().unwrap();
        assert_eq!(record.get_text("facility").as_deref(), Some("Clinic B"));
    }

    #[tokio::test]
    async fn test_extract_without_source_is_configuration_error() {
        let (_dir, staging) = staging();
        let adapter = RelatedTableAdapter::new();

        let err = adapter
            .extract(&AttributeStore::default(), &staging)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }
}
