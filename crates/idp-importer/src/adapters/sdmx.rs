//! SDMX statistical feed adapter
//!
//! Reads an SDMX-ML generic data message: every `Obs` becomes one raw
//! record carrying its series key values plus `TIME_PERIOD` and
//! `OBS_VALUE`. Namespace prefixes vary between publishers, so elements
//! are matched by local name.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter, RawRecord};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::{ImportError, Result};

pub struct SdmxAdapter;

impl SdmxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SdmxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormatAdapter for SdmxAdapter {
    fn input_format(&self) -> InputFormat {
        InputFormat::Sdmx
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        vec![AttributeSpec::required("url", AttributeKind::Text)]
    }

    async fn extract(&self, attrs: &AttributeStore, staging: &Staging) -> Result<Extraction> {
        let url = attrs.require_text("url")?;

        let client = reqwest::Client::new();
        let path = staging.fetch_or_reuse(client.get(url), url, "xml").await?;
        let text = tokio::fs::read_to_string(&path).await?;

        Ok(Extraction::from_records(parse_generic_data(&text)?))
    }
}

/// Parse an SDMX-ML generic data message into raw records
fn parse_generic_data(text: &str) -> Result<Vec<RawRecord>> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut series_key: BTreeMap<String, Value> = BTreeMap::new();
    let mut obs: Option<BTreeMap<String, Value>> = None;
    let mut row = 0u64;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ImportError::Format(format!("bad SDMX document: {e}")))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"Series" => series_key.clear(),
                b"Value" => {
                    if let (Some(id), Some(value)) =
                        (attr_value(e, b"id")?, attr_value(e, b"value")?)
                    {
                        // Dimension values bind to the observation when one
                        // is open, to the series key otherwise.
                        match obs.as_mut() {
                            Some(fields) => fields.insert(id, Value::String(value)),
                            None => series_key.insert(id, Value::String(value)),
                        };
                    }
                },
                b"Obs" => obs = Some(series_key.clone()),
                b"ObsDimension" => {
                    if let (Some(fields), Some(value)) = (obs.as_mut(), attr_value(e, b"value")?) {
                        fields.insert("TIME_PERIOD".to_string(), Value::String(value));
                    }
                },
                b"ObsValue" => {
                    if let (Some(fields), Some(value)) = (obs.as_mut(), attr_value(e, b"value")?) {
                        fields.insert("OBS_VALUE".to_string(), Value::String(value));
                    }
                },
                _ => {},
            },
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"Obs" {
                    if let Some(fields) = obs.take() {
                        row += 1;
                        records.push(RawRecord { row, fields });
                    }
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if records.is_empty() && !text.contains("DataSet") {
        return Err(ImportError::Format(
            "document contains no SDMX data set".into(),
        ));
    }

    Ok(records)
}

fn attr_value(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ImportError::Format(format!("bad SDMX attribute: {e}")))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|e| ImportError::Format(format!("bad SDMX attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
