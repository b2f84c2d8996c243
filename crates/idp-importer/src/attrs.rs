//! Typed per-importer attributes
//!
//! Importers carry adapter configuration (URLs, credentials, uploaded
//! files) as a typed key/value map, so adding an input format never needs
//! a schema change. Each adapter declares the attributes it needs and the
//! store validates the declaration before extraction starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use idp_common::{ImportError, Result};

/// A single typed attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    /// Reference to an uploaded file blob on local storage
    FileRef(PathBuf),
}

/// Expected type of a declared attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Text,
    File,
}

/// One attribute an adapter declares it reads
#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub kind: AttributeKind,
    pub required: bool,
}

impl AttributeSpec {
    pub const fn required(name: &'static str, kind: AttributeKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: AttributeKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Typed attribute map for one importer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeStore {
    values: BTreeMap<String, AttributeValue>,
}

impl AttributeStore {
    pub fn new(values: BTreeMap<String, AttributeValue>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(AttributeValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_file(&self, name: &str) -> Option<&Path> {
        match self.values.get(name) {
            Some(AttributeValue::FileRef(p)) => Some(p.as_path()),
            _ => None,
        }
    }

    /// Fetch a required text attribute
    ///
    /// # Errors
    ///
    /// Returns `ImportError::Configuration` when the attribute is missing
    /// or not text.
    pub fn require_text(&self, name: &str) -> Result<&str> {
        self.get_text(name)
            .ok_or_else(|| ImportError::Configuration(format!("missing text attribute '{name}'")))
    }

    /// Fetch a required file attribute
    pub fn require_file(&self, name: &str) -> Result<&Path> {
        self.get_file(name)
            .ok_or_else(|| ImportError::Configuration(format!("missing file attribute '{name}'")))
    }

    /// Validate this store against an adapter's declared schema
    ///
    /// All violations are collected into a single configuration error so
    /// an operator can fix everything at once.
    pub fn validate(&self, schema: &[AttributeSpec]) -> Result<()> {
        let mut problems = Vec::new();

        for spec in schema {
            match (self.values.get(spec.name), spec.kind) {
                (None, _) if spec.required => {
                    problems.push(format!("'{}' is required", spec.name));
                },
                (None, _) => {},
                (Some(AttributeValue::Text(_)), AttributeKind::Text) => {},
                (Some(AttributeValue::FileRef(_)), AttributeKind::File) => {},
                (Some(_), AttributeKind::Text) => {
                    problems.push(format!("'{}' must be text", spec.name));
                },
                (Some(_), AttributeKind::File) => {
                    problems.push(format!("'{}' must be a file reference", spec.name));
                },
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Configuration(format!(
                "invalid attributes: {}",
                problems.join("; ")
            )))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeStore {
    fn from(values: BTreeMap<String, AttributeValue>) -> Self {
        Self::new(values)
    }
}
