//! SharePoint workbook adapter (wide and long layouts)
//!
//! Downloads a workbook from an authenticated SharePoint file URL into
//! staging, then decodes and reshapes it exactly like the Excel adapter.
//! Authentication is a bearer token or basic credentials; deeper
//! SharePoint API flows are out of scope.

use async_trait::async_trait;

use super::excel::load_workbook_rows;
use super::tabular::{parse_id_columns, SheetLayout, Table};
use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::Result;

pub struct SharePointAdapter {
    format: InputFormat,
}

impl SharePointAdapter {
    pub fn new(format: InputFormat) -> Self {
        debug_assert!(matches!(
            format,
            InputFormat::SharePointWide | InputFormat::SharePointLong
        ));
        Self { format }
    }

    fn layout(&self) -> SheetLayout {
        match self.format {
            InputFormat::SharePointWide => SheetLayout::Wide,
            _ => SheetLayout::Long,
        }
    }
}

#[async_trait]
impl FormatAdapter for SharePointAdapter {
    fn input_format(&self) -> InputFormat {
        self.format
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        let mut schema = vec![
            AttributeSpec::required("file_url", AttributeKind::Text),
            AttributeSpec::optional("auth_token", AttributeKind::Text),
            AttributeSpec::optional("username", AttributeKind::Text),
            AttributeSpec::optional("password", AttributeKind::Text),
            AttributeSpec::optional("sheet", AttributeKind::Text),
        ];
        if self.layout() == SheetLayout::Wide {
            schema.push(AttributeSpec::required("id_columns", AttributeKind::Text));
        }
        schema
    }

    async fn extract(&self, attrs: &AttributeStore, staging: &Staging) -> Result<Extraction> {
        let file_url = attrs.require_text("file_url")?;
        let sheet = attrs.get_text("sheet").map(String::from);

        let id_columns = if self.layout() == SheetLayout::Wide {
            parse_id_columns(attrs.require_text("id_columns")?)
        } else {
            Vec::new()
        };

        let client = reqwest::Client::new();
        let mut request = client.get(file_url);
        if let Some(token) = attrs.get_text("auth_token") {
            request = request.bearer_auth(token);
        } else if let Some(username) = attrs.get_text("username") {
            request = request.basic_auth(username, attrs.get_text("password"));
        }

        let path = staging.fetch_or_reuse(request, file_url, "xlsx").await?;
        let table = Table::from_rows(load_workbook_rows(path, sheet).await?)?;
        Ok(Extraction::from_records(
            table.into_records(self.layout(), &id_columns),
        ))
    }
}
