//! Typed metadata bags
//!
//! Entities carry JSON metadata. The keys the core actually reads are typed
//! fields; everything else rides along in a flattened passthrough map so a
//! provider payload written verbatim survives a round trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Free-form JSON object used for summary rows.
pub type JsonMap = Map<String, Value>;

/// Metadata stored on a customer row.
///
/// `metadata[provider]` namespaces the data each source contributed;
/// `sources` lists every source that has contributed to the row, in the
/// order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    #[serde(flatten)]
    pub namespaces: BTreeMap<String, Value>,
}

impl CustomerMetadata {
    /// Metadata carrying a single provider namespace.
    pub fn for_source(source: &str, namespace: Value) -> Self {
        let mut meta = Self::default();
        meta.add_source(source);
        meta.namespaces.insert(source.to_string(), namespace);
        meta
    }

    pub fn namespace(&self, source: &str) -> Option<&Value> {
        self.namespaces.get(source)
    }

    /// Record `source` as a contributor if it isn't already.
    pub fn add_source(&mut self, source: &str) {
        if !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }
    }

    /// Replace the namespace written by `source`.
    pub fn set_namespace(&mut self, source: &str, namespace: Value) {
        self.add_source(source);
        self.namespaces.insert(source.to_string(), namespace);
    }

    /// Shallow-merge `patch` into the `source` namespace. Keys in `patch` win.
    pub fn merge_into_namespace(&mut self, source: &str, patch: JsonMap) {
        self.add_source(source);
        let entry = self
            .namespaces
            .entry(source.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(existing) => existing.extend(patch),
            other => *other = Value::Object(patch),
        }
    }

    /// Fold another row's metadata into this one: sources become the ordered
    /// union, namespaces missing here are copied, and object namespaces
    /// present on both sides keep this row's keys on collision.
    pub fn absorb(&mut self, other: &CustomerMetadata) {
        for source in &other.sources {
            self.add_source(source);
        }
        for (key, value) in &other.namespaces {
            match (self.namespaces.get_mut(key), value) {
                (None, _) => {
                    self.namespaces.insert(key.clone(), value.clone());
                }
                (Some(Value::Object(mine)), Value::Object(theirs)) => {
                    for (k, v) in theirs {
                        mine.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                (Some(_), _) => {}
            }
        }
    }
}

/// Metadata stored on an integration connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Consecutive failed sync attempts since the last success.
    #[serde(default)]
    pub error_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(flatten)]
    pub other: JsonMap,
}

impl ConnectionMetadata {
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.error_count
    }

    pub fn record_success(&mut self) {
        self.error_count = 0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_customer_metadata_flattens_namespaces() {
        let meta = CustomerMetadata::for_source("stripe", json!({"delinquent": false}));
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value, json!({"sources": ["stripe"], "stripe": {"delinquent": false}}));

        let back: CustomerMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_absorb_unions_sources_in_order() {
        let mut primary = CustomerMetadata::for_source("stripe", json!({"a": 1}));
        let other = CustomerMetadata::for_source("hubspot", json!({"lifecycle": "customer"}));
        primary.absorb(&other);
        assert_eq!(primary.sources, vec!["stripe", "hubspot"]);
        assert_eq!(primary.namespace("hubspot"), Some(&json!({"lifecycle": "customer"})));
    }

    #[test]
    fn test_absorb_keeps_existing_keys() {
        let mut primary = CustomerMetadata::for_source("stripe", json!({"a": 1}));
        let other = CustomerMetadata::for_source("stripe", json!({"a": 2, "b": 3}));
        primary.absorb(&other);
        assert_eq!(primary.namespace("stripe"), Some(&json!({"a": 1, "b": 3})));
        assert_eq!(primary.sources, vec!["stripe"]);
    }

    #[test]
    fn test_merge_into_namespace() {
        let mut meta = CustomerMetadata::default();
        let mut patch = JsonMap::new();
        patch.insert("company".into(), json!("Acme"));
        meta.merge_into_namespace("hubspot", patch);
        assert_eq!(meta.namespace("hubspot"), Some(&json!({"company": "Acme"})));
    }

    #[test]
    fn test_connection_metadata_passthrough() {
        let raw = json!({"error_count": 2, "portal_name": "Acme Portal"});
        let mut meta: ConnectionMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.error_count, 2);
        assert_eq!(meta.record_failure("boom"), 3);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["portal_name"], json!("Acme Portal"));
        assert_eq!(value["last_error"], json!("boom"));
        meta.record_success();
        assert_eq!(meta.error_count, 0);
        assert!(meta.last_error.is_none());
    }
}
