//! Vector context-layer adapter
//!
//! Reads a GeoJSON FeatureCollection whose features attach contextual
//! data to geographies. Feature properties become record fields; the
//! geometry is carried through serialized under `geometry`.

use geojson::GeoJson;
use serde_json::Value;

use async_trait::async_trait;

use super::{AttributeKind, AttributeSpec, Extraction, FormatAdapter, RawRecord};
use crate::attrs::AttributeStore;
use crate::config::InputFormat;
use crate::staging::Staging;
use idp_common::{ImportError, Result};

pub struct VectorLayerAdapter;

impl VectorLayerAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VectorLayerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormatAdapter for VectorLayerAdapter {
    fn input_format(&self) -> InputFormat {
        InputFormat::VectorLayer
    }

    fn declare_schema(&self) -> Vec<AttributeSpec> {
        vec![
            AttributeSpec::optional("layer_file", AttributeKind::File),
            AttributeSpec::optional("url", AttributeKind::Text),
        ]
    }

    async fn extract(&self, attrs: &AttributeStore, staging: &Staging) -> Result<Extraction> {
        let text = match (attrs.get_file("layer_file"), attrs.get_text("url")) {
            (Some(path), _) => {
                if !path.exists() {
                    return Err(ImportError::Configuration(format!(
                        "layer file not found: {}",
                        path.display()
                    )));
                }
                tokio::fs::read_to_string(path).await?
            },
            (None, Some(url)) => {
                let client = reqwest::Client::new();
                let path = staging
                    .fetch_or_reuse(client.get(url), url, "geojson")
                    .await?;
                tokio::fs::read_to_string(&path).await?
            },
            (None, None) => {
                return Err(ImportError::Configuration(
                    "vector layer needs a 'layer_file' or 'url' attribute".into(),
                ))
            },
        };

        Ok(Extraction::from_records(parse_feature_collection(&text)?))
    }
}

fn parse_feature_collection(text: &str) -> Result<Vec<RawRecord>> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e| ImportError::Format(format!("bad GeoJSON: {e}")))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        other => {
            return Err(ImportError::Format(format!(
                "expected a FeatureCollection, got {}",
                match other {
                    GeoJson::Feature(_) => "a single Feature",
                    GeoJson::Geometry(_) => "a bare Geometry",
                    GeoJson::FeatureCollection(_) => unreachable!(),
                }
            )))
        },
    };

    let mut records = Vec::new();
    for (i, feature) in collection.features.into_iter().enumerate() {
        let mut record = RawRecord::new(i as u64 + 1);

        if let Some(properties) = feature.properties {
            for (name, value) in properties {
                record.fields.insert(name, value);
            }
        }
        if let Some(geometry) = feature.geometry {
            record.fields.insert(
                "geometry".to_string(),
                serde_json::to_value(&geometry)
                    .map_err(|e| ImportError::Format(format!("unserializable geometry: {e}")))?,
            );
        }

        records.push(record);
    }

    Ok(records)
}
