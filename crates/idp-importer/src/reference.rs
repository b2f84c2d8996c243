//! Administrative/geographic reference data
//!
//! The reference dataset is the hierarchy of administrative areas that
//! external codes resolve against during mapping. It is read-only from the
//! importer's viewpoint; imports never write to it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One administrative/geographic entity in the reference hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoEntity {
    pub id: Uuid,
    /// Code in the scheme it was registered under
    pub code: String,
    pub name: String,
    /// Hierarchy level, e.g. "country", "region", "district"
    pub level: String,
}

/// Lookup of external administrative codes against the reference hierarchy
///
/// Implementations are expected to be cheap per call (pre-loaded or cached);
/// the mapper resolves one code per record.
pub trait ReferenceDataset: Send + Sync {
    /// Resolve a code of the given scheme, if it names a known entity
    fn resolve(&self, code_type: &str, code: &str) -> Option<GeoEntity>;

    /// Dataset label, for logging
    fn name(&self) -> &str;
}

/// Reference dataset held fully in memory
///
/// Entities are registered per code scheme; codes are matched
/// case-insensitively with surrounding whitespace ignored, since exports
/// are rarely tidy about either.
#[derive(Debug, Default)]
pub struct InMemoryReference {
    name: String,
    by_code: HashMap<(String, String), GeoEntity>,
}

impl InMemoryReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            by_code: HashMap::new(),
        }
    }

    pub fn insert(&mut self, code_type: &str, entity: GeoEntity) {
        self.by_code
            .insert((code_type.to_string(), normalize(&entity.code)), entity);
    }

    pub fn with_entity(mut self, code_type: &str, entity: GeoEntity) -> Self {
        self.insert(code_type, entity);
        self
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl ReferenceDataset for InMemoryReference {
    fn resolve(&self, code_type: &str, code: &str) -> Option<GeoEntity> {
        self.by_code
            .get(&(code_type.to_string(), normalize(code)))
            .cloned()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(code: &str) -> GeoEntity {
        GeoEntity {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: format!("Area {code}"),
            level: "district".to_string(),
        }
    }

    #[test]
    fn test_resolve_normalizes_code() {
        let reference = InMemoryReference::new("admin").with_entity("pcode", entity("KE-001"));

        assert!(reference.resolve("pcode", "ke-001").is_some());
        assert!(reference.resolve("pcode", "  KE-001 ").is_some());
        assert!(reference.resolve("pcode", "KE-002").is_none());
    }

    #[test]
    fn test_resolve_is_scoped_by_code_type() {
        let reference = InMemoryReference::new("admin").with_entity("pcode", entity("001"));

        assert!(reference.resolve("pcode", "001").is_some());
        assert!(reference.resolve("iso", "001").is_none());
    }
}
