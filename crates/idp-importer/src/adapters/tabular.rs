//! Shared table model for row/column sources
//!
//! Spreadsheet, CSV, and related-table adapters all decode into a
//! [`Table`] first; this module owns the header handling and the
//! wide-to-long unpivot shared between them.

use serde_json::Value;

use super::RawRecord;
use idp_common::{ImportError, Result};

/// How a tabular source lays out its observations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetLayout {
    /// One row per observation
    Long,
    /// One row per entity, one column per period; unpivoted on read
    Wide,
}

/// A decoded tabular payload: one header row plus data rows
#[derive(Debug, Clone)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table from raw rows, taking the first row as headers
    ///
    /// # Errors
    ///
    /// Returns `ImportError::Format` when there is no header row or the
    /// header row is entirely blank.
    pub fn from_rows(mut raw_rows: Vec<Vec<Value>>) -> Result<Self> {
        if raw_rows.is_empty() {
            return Err(ImportError::Format("source has no header row".into()));
        }

        let headers: Vec<String> = raw_rows
            .remove(0)
            .iter()
            .map(|cell| match cell {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();

        if headers.iter().all(String::is_empty) {
            return Err(ImportError::Format("header row is blank".into()));
        }

        Ok(Self {
            headers,
            rows: raw_rows,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Convert to raw records under the given layout
    ///
    /// `id_columns` only matters for the wide layout: those columns are
    /// carried onto every unpivoted record, every other column becomes one
    /// record per (row, column) with `period` = column header and `value`
    /// = cell content. Blank cells produce no record.
    ///
    /// Row references are 1-based source rows, counting the header as
    /// row 1.
    pub fn into_records(self, layout: SheetLayout, id_columns: &[String]) -> Vec<RawRecord> {
        match layout {
            SheetLayout::Long => self.into_long_records(),
            SheetLayout::Wide => self.into_wide_records(id_columns),
        }
    }

    fn into_long_records(self) -> Vec<RawRecord> {
        let headers = self.headers;
        self.rows
            .into_iter()
            .enumerate()
            .filter(|(_, cells)| !row_is_blank(cells))
            .map(|(i, cells)| {
                let mut record = RawRecord::new(i as u64 + 2);
                for (header, cell) in headers.iter().zip(cells) {
                    if !header.is_empty() {
                        record.fields.insert(header.clone(), cell);
                    }
                }
                record
            })
            .collect()
    }

    fn into_wide_records(self, id_columns: &[String]) -> Vec<RawRecord> {
        let headers = self.headers;
        let mut records = Vec::new();

        for (i, cells) in self.rows.into_iter().enumerate() {
            if row_is_blank(&cells) {
                continue;
            }
            let row_no = i as u64 + 2;

            let identity: Vec<(String, Value)> = headers
                .iter()
                .zip(cells.iter())
                .filter(|(h, _)| id_columns.contains(h))
                .map(|(h, c)| (h.clone(), c.clone()))
                .collect();

            for (header, cell) in headers.iter().zip(cells) {
                if header.is_empty() || id_columns.contains(header) || cell_is_blank(&cell) {
                    continue;
                }
                let mut record = RawRecord::new(row_no);
                for (name, value) in &identity {
                    record.fields.insert(name.clone(), value.clone());
                }
                record
                    .fields
                    .insert("period".to_string(), Value::String(header.clone()));
                record.fields.insert("value".to_string(), cell);
                records.push(record);
            }
        }

        records
    }
}

/// Parse a comma-separated `id_columns` attribute value
pub fn parse_id_columns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn row_is_blank(cells: &[Value]) -> bool {
    cells.iter().all(cell_is_blank)
}

fn cell_is_blank(cell: &Value) -> bool {
    match cell {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_rows() -> Vec<Vec<Value>> {
        vec![
            vec![json!("GEO"), json!("2021"), json!("2022")],
            vec![json!("KE-001"), json!(10.5), json!(11.0)],
            vec![json!("KE-002"), json!(null), json!(9.25)],
        ]
    }

    #[test]
    fn test_from_rows_requires_header() {
        assert!(Table::from_rows(Vec::new()).is_err());
        assert!(Table::from_rows(vec![vec![json!(null), json!("")]]).is_err());
    }

    #[test]
    fn test_long_layout_one_record_per_row() {
        let table = Table::from_rows(sample_rows()).unwrap();
        let records = table.into_records(SheetLayout::Long, &[]);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row, 2);
        assert_eq!(records[0].get_text("GEO").as_deref(), Some("KE-001"));
        assert_eq!(records[0].get_text("2021").as_deref(), Some("10.5"));
        assert_eq!(records[1].row, 3);
    }

    #[test]
    fn test_wide_layout_unpivots_value_columns() {
        let table = Table::from_rows(sample_rows()).unwrap();
        let records = table.into_records(SheetLayout::Wide, &["GEO".to_string()]);

        // Row 2 has two observations, row 3 only one (2021 is blank)
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].get_text("GEO").as_deref(), Some("KE-001"));
        assert_eq!(records[0].get_text("period").as_deref(), Some("2021"));
        assert_eq!(records[0].get_text("value").as_deref(), Some("10.5"));

        assert_eq!(records[2].row, 3);
        assert_eq!(records[2].get_text("GEO").as_deref(), Some("KE-002"));
        assert_eq!(records[2].get_text("period").as_deref(), Some("2022"));
    }

    #[test]
    fn test_blank_rows_are_skipped() {
        let mut rows = sample_rows();
        rows.push(vec![json!(""), json!(null), json!("")]);
        let table = Table::from_rows(rows).unwrap();

        assert_eq!(table.row_count(), 3);
        let records = table.into_records(SheetLayout::Long, &[]);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_parse_id_columns() {
        assert_eq!(
            parse_id_columns("GEO, Name ,"),
            vec!["GEO".to_string(), "Name".to_string()]
        );
        assert!(parse_id_columns("  ").is_empty());
    }
}
