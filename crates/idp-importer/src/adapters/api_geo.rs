//! Feature-service API adapter (wide and long layouts)
//!
//! Pulls paginated JSON from an ArcGIS-style feature service
//! (`resultOffset`/`resultRecordCount` paging, `f=json`). Records carry
//! the feature attributes plus a serialized `geometry` field; pages are
//! fetched lazily as the orchestrator consumes the stream.

use futures::stream::TryStreamExt;
use serde_json::Value;

use async_trait::async_trait;

use super::tabular::parse_id_columns;
use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter, RawRecord};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::{map_reqwest_error, Staging};
use idp_common::{ImportError, Result};

const DEFAULT_PAGE_SIZE: u64 = 1000;

pub struct ApiGeographyAdapter {
    format: InputFormat,
}

impl ApiGeographyAdapter {
    pub fn new(format: InputFormat) -> Self {
        debug_assert!(matches!(
            format,
            InputFormat::ApiGeographyWide | InputFormat::ApiGeographyLong
        ));
        Self { format }
    }

    fn is_wide(&self) -> bool {
        self.format == InputFormat::ApiGeographyWide
    }
}

#[async_trait]
impl FormatAdapter for ApiGeographyAdapter {
    fn input_format(&self) -> InputFormat {
        self.format
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        let mut schema = vec![
            AttributeSpec::required("query_url", AttributeKind::Text),
            AttributeSpec::optional("where_clause", AttributeKind::Text),
            AttributeSpec::optional("page_size", AttributeKind::Text),
        ];
        if self.is_wide() {
            schema.push(AttributeSpec::required("id_columns", AttributeKind::Text));
        }
        schema
    }

    async fn extract(&self, attrs: &AttributeStore, _staging: &Staging) -> Result<Extraction> {
        let query_url = attrs.require_text("query_url")?.to_string();
        let where_clause = attrs.get_text("where_clause").unwrap_or("1=1").to_string();
        let page_size = match attrs.get_text("page_size") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                ImportError::Configuration(format!("page_size must be a number, got '{raw}'"))
            })?,
            None => DEFAULT_PAGE_SIZE,
        };
        let id_columns = if self.is_wide() {
            parse_id_columns(attrs.require_text("id_columns")?)
        } else {
            Vec::new()
        };

        let client = reqwest::Client::new();

        // Count preflight; failure here is non-fatal, the service may not
        // support returnCountOnly.
        let source_rows = query_count(&client, &query_url, &where_clause).await;

        let state = PageState {
            client,
            query_url,
            where_clause,
            page_size,
            offset: 0,
            row: 0,
            wide: self.is_wide(),
            id_columns,
            done: false,
        };

        let records = futures::stream::try_unfold(state, fetch_page)
            .map_ok(|page| futures::stream::iter(page.into_iter().map(Ok)))
            .try_flatten();

        Ok(Extraction {
            records: Box::pin(records),
            source_rows,
        })
    }
}

struct PageState {
    client: reqwest::Client,
    query_url: String,
    where_clause: String,
    page_size: u64,
    offset: u64,
    row: u64,
    wide: bool,
    id_columns: Vec<String>,
    done: bool,
}

async fn fetch_page(mut st: PageState) -> Result<Option<(Vec<RawRecord>, PageState)>> {
    if st.done {
        return Ok(None);
    }

    let url = format!(
        "{}?where={}&outFields=*&f=json&outSR=4326&resultRecordCount={}&resultOffset={}",
        st.query_url, st.where_clause, st.page_size, st.offset
    );

    let body: Value = st
        .client
        .get(&url)
        .send()
        .await
        .map_err(map_reqwest_error)?
        .error_for_status()
        .map_err(map_reqwest_error)?
        .json()
        .await
        .map_err(map_reqwest_error)?;

    if let Some(error) = body.get("error") {
        return Err(ImportError::Format(format!(
            "feature service error: {error}"
        )));
    }

    let features = body
        .get("features")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let fetched = features.len() as u64;
    let mut records = Vec::new();
    for feature in &features {
        st.row += 1;
        records.extend(feature_records(feature, st.row, st.wide, &st.id_columns));
    }

    st.offset += fetched;
    if fetched < st.page_size {
        st.done = true;
    }

    Ok(Some((records, st)))
}

/// Convert one feature into raw records
///
/// Long layout: one record with all attributes plus the geometry. Wide
/// layout: attributes outside `id_columns` unpivot into (period, value)
/// records; geometry context comes from the resolved geography instead.
fn feature_records(feature: &Value, row: u64, wide: bool, id_columns: &[String]) -> Vec<RawRecord> {
    let attributes = feature
        .get("attributes")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if !wide {
        let mut record = RawRecord::new(row);
        for (name, value) in attributes {
            record.fields.insert(name, value);
        }
        if let Some(geometry) = feature.get("geometry") {
            record.fields.insert("geometry".to_string(), geometry.clone());
        }
        return vec![record];
    }

    let identity: Vec<(String, Value)> = attributes
        .iter()
        .filter(|(name, _)| id_columns.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    attributes
        .iter()
        .filter(|(name, value)| !id_columns.contains(name) && !value.is_null())
        .map(|(name, value)| {
            let mut record = RawRecord::new(row);
            for (id_name, id_value) in &identity {
                record.fields.insert(id_name.clone(), id_value.clone());
            }
            record
                .fields
                .insert("period".to_string(), Value::String(name.clone()));
            record.fields.insert("value".to_string(), value.clone());
            record
        })
        .collect()
}

async fn query_count(client: &reqwest::Client, query_url: &str, where_clause: &str) -> Option<u64> {
    let url = format!("{query_url}?where={where_clause}&returnCountOnly=true&f=json");
    let response = client.get(&url).send().await.ok()?;
    let body: Value = response.json().await.ok()?;
    body.get("count")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttributeValue;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn staging() -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path(), Duration::from_secs(60));
        (dir, staging)
    }

    fn feature(geo: &str, population: f64) -> Value {
        json!({
            "attributes": { "GEO_CODE": geo, "POP": population },
            "geometry": { "x": 36.8, "y": -1.3 }
        })
    }

    #[tokio::test]
    async fn test_extract_pages_until_short_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(query_param("returnCountOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 3 })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(query_param("resultOffset", "0"))
            .and(query_param("resultRecordCount", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [feature("KE-001", 100.0), feature("KE-002", 200.0)]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(query_param("resultOffset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [feature("KE-003", 300.0)]
            })))
            .mount(&server)
            .await;

        let (_dir, staging) = staging();
        let adapter = ApiGeographyAdapter::new(InputFormat::ApiGeographyLong);

        let mut attrs = AttributeStore::default();
        attrs.set("query_url", AttributeValue::Text(format!("{}/query", server.uri())));
        attrs.set("page_size", AttributeValue::Text("2".into()));

        let extraction = adapter.extract(&attrs, &staging).await.unwrap();
        assert_eq!(extraction.source_rows, Some(3));

        let records: Vec<_> = extraction.records.try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get_text("GEO_CODE").as_deref(), Some("KE-001"));
        assert!(records[0].get("geometry").is_some());
        assert_eq!(records[2].row, 3);
    }

    #[tokio::test]
    async fn test_service_error_body_is_format_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": { "code": 400, "message": "Invalid where clause" }
            })))
            .mount(&server)
            .await;

        let (_dir, staging) = staging();
        let adapter = ApiGeographyAdapter::new(InputFormat::ApiGeographyLong);

        let mut attrs = AttributeStore::default();
        attrs.set("query_url", AttributeValue::Text(format!("{}/query", server.uri())));

        let extraction = adapter.extract(&attrs, &staging).await.unwrap();
        let result: Result<Vec<_>> = extraction.records.try_collect().await;
        assert!(matches!(result.unwrap_err(), ImportError::Format(_)));
    }

    #[test]
    fn test_wide_feature_unpivot() {
        let feature = json!({
            "attributes": { "GEO_CODE": "KE-001", "Y2021": 10.0, "Y2022": 11.0, "EMPTY": null }
        });

        let records = feature_records(&feature, 1, true, &["GEO_CODE".to_string()]);
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.get_text("GEO_CODE").as_deref(), Some("KE-001"));
            assert!(record.get_text("period").is_some());
            assert!(record.get_text("value").is_some());
        }
    }
}
