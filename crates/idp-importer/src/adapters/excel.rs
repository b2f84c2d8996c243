//! Excel workbook adapter (wide and long layouts)
//!
//! Reads a staged `.xlsx`/`.xls` workbook referenced by the `workbook`
//! file attribute. Decoding runs on a blocking thread; the decoded sheet
//! goes through the shared tabular reshaping.

use serde_json::Value;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader};

use super::tabular::{parse_id_columns, SheetLayout, Table};
use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::{ImportError, Result};

pub struct ExcelAdapter {
    format: InputFormat,
}

impl ExcelAdapter {
    pub fn new(format: InputFormat) -> Self {
        debug_assert!(matches!(
            format,
            InputFormat::ExcelWide | InputFormat::ExcelLong
        ));
        Self { format }
    }

    fn layout(&self) -> SheetLayout {
        match self.format {
            InputFormat::ExcelWide => SheetLayout::Wide,
            _ => SheetLayout::Long,
        }
    }
}

#[async_trait]
impl FormatAdapter for ExcelAdapter {
    fn input_format(&self) -> InputFormat {
        self.format
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        let mut schema = vec![
            AttributeSpec::required("workbook", AttributeKind::File),
            AttributeSpec::optional("sheet", AttributeKind::Text),
        ];
        if self.layout() == SheetLayout::Wide {
            schema.push(AttributeSpec::required("id_columns", AttributeKind::Text));
        }
        schema
    }

    async fn extract(&self, attrs: &AttributeStore, _staging: &Staging) -> Result<Extraction> {
        let path = attrs.require_file("workbook")?.to_path_buf();
        let sheet = attrs.get_text("sheet").map(String::from);

        let id_columns = if self.layout() == SheetLayout::Wide {
            parse_id_columns(attrs.require_text("id_columns")?)
        } else {
            Vec::new()
        };

        let rows = load_workbook_rows(path, sheet).await?;
        let table = Table::from_rows(rows)?;
        Ok(Extraction::from_records(
            table.into_records(self.layout(), &id_columns),
        ))
    }
}

/// Decode a workbook into raw rows on a blocking thread
///
/// Shared with the SharePoint adapter, which stages a workbook first and
/// decodes it the same way.
pub(crate) async fn load_workbook_rows(
    path: PathBuf,
    sheet: Option<String>,
) -> Result<Vec<Vec<Value>>> {
    if !path.exists() {
        return Err(ImportError::Configuration(format!(
            "workbook file not found: {}",
            path.display()
        )));
    }

    tokio::task::spawn_blocking(move || decode_workbook(&path, sheet.as_deref()))
        .await
        .map_err(|e| ImportError::Format(format!("workbook decode task: {e}")))?
}

fn decode_workbook(path: &Path, sheet: Option<&str>) -> Result<Vec<Vec<Value>>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ImportError::Format(format!("cannot open workbook: {e}")))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| ImportError::Format("workbook has no sheets".into()))?,
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ImportError::Format(format!("cannot read sheet '{sheet_name}': {e}")))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_to_value).collect())
        .collect())
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Float(f) => serde_json::json!(f),
        Data::Int(i) => serde_json::json!(i),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) if naive.time() == chrono::NaiveTime::MIN => {
                Value::String(naive.date().format("%Y-%m-%d").to_string())
            },
            Some(naive) => Value::String(naive.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => serde_json::json!(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttributeValue;
    use std::time::Duration;

    fn staging() -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path(), Duration::from_secs(60));
        (dir, staging)
    }

    #[test]
    fn test_cell_conversion() {
        assert_eq!(cell_to_value(&Data::Empty), Value::Null);
        assert_eq!(
            cell_to_value(&Data::String("x".into())),
            Value::String("x".into())
        );
        assert_eq!(cell_to_value(&Data::Float(1.5)), serde_json::json!(1.5));
        assert_eq!(cell_to_value(&Data::Int(7)), serde_json::json!(7));
        assert_eq!(cell_to_value(&Data::Bool(true)), Value::Bool(true));
        assert_eq!(
            cell_to_value(&Data::DateTimeIso("2023-01-05".into())),
            Value::String("2023-01-05".into())
        );
    }

    #[test]
    fn test_wide_variant_requires_id_columns() {
        let wide = ExcelAdapter::new(InputFormat::ExcelWide);
        assert!(wide
            .declare_schema()
            .iter()
            .any(|s| s.name == "id_columns" && s.required));

        let long = ExcelAdapter::new(InputFormat::ExcelLong);
        assert!(!long.declare_schema().iter().any(|s| s.name == "id_columns"));
    }

    #[tokio::test]
    async fn test_extract_missing_workbook_is_configuration_error() {
        let (_dir, staging) = staging();
        let adapter = ExcelAdapter::new(InputFormat::ExcelLong);

        let mut attrs = AttributeStore::default();
        attrs.set(
            "workbook",
            AttributeValue::FileRef("/nonexistent/wb.xlsx".into()),
        );

        let err = adapter.extract(&attrs, &staging).await.unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)), "{err}");
    }

    #[tokio::test]
    async fn test_extract_without_workbook_attribute() {
        let (_dir, staging) = staging();
        let adapter = ExcelAdapter::new(InputFormat::ExcelLong);

        let err = adapter
            .extract(&AttributeStore::default(), &staging)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }
}
