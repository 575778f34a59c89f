//! Singer catalog document model.
//!
//! A catalog enumerates the streams a tap exposes. Each stream carries a
//! JSON schema and a `metadata` array of breadcrumb-addressed entries; the
//! empty breadcrumb addresses the stream itself, `["properties", <p>]`
//! addresses a field. Selection and user overlays are encoded by mutating
//! these entries, never by rewriting the schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One breadcrumb-addressed metadata entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MetadataEntry {
    /// Entry for the stream root (empty breadcrumb).
    #[must_use]
    pub fn root() -> Self {
        Self {
            breadcrumb: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Entry for a top-level property.
    #[must_use]
    pub fn property(name: &str) -> Self {
        Self {
            breadcrumb: vec!["properties".to_string(), name.to_string()],
            metadata: Map::new(),
        }
    }

    /// Whether this entry addresses the stream root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.breadcrumb.is_empty()
    }

    /// The property name, when this entry addresses one.
    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        match self.breadcrumb.as_slice() {
            [first, name] if first == "properties" => Some(name),
            _ => None,
        }
    }

    /// Current `selected` flag, when one has been written.
    #[must_use]
    pub fn selected(&self) -> Option<bool> {
        self.metadata.get("selected").and_then(Value::as_bool)
    }

    /// Write the `selected` flag.
    pub fn set_selected(&mut self, selected: bool) {
        self.metadata
            .insert("selected".to_string(), Value::Bool(selected));
    }

    /// The `inclusion` marker (`available`, `automatic`, `unsupported`).
    #[must_use]
    pub fn inclusion(&self) -> Option<&str> {
        self.metadata.get("inclusion").and_then(Value::as_str)
    }
}

/// A discoverable stream exposed by a tap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogStream {
    /// Stream identifier as the tap names it.
    #[serde(alias = "tap_stream_id")]
    pub tap_stream_name: String,
    /// JSON schema of the records.
    pub schema: Value,
    /// Breadcrumb-addressed metadata entries.
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_method: Option<String>,
    /// Legacy mirror of the root metadata `selected` flag.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub selected: bool,
    /// Display name; most taps emit the same value as the identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

impl CatalogStream {
    /// The root metadata entry, creating it when the tap omitted one.
    pub fn root_metadata_mut(&mut self) -> &mut MetadataEntry {
        let idx = self.metadata.iter().position(MetadataEntry::is_root);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                self.metadata.push(MetadataEntry::root());
                self.metadata.len() - 1
            }
        };
        &mut self.metadata[idx]
    }

    /// The root metadata entry, when present.
    #[must_use]
    pub fn root_metadata(&self) -> Option<&MetadataEntry> {
        self.metadata.iter().find(|entry| entry.is_root())
    }

    /// The metadata entry for a top-level property, creating it on demand.
    pub fn property_metadata_mut(&mut self, name: &str) -> &mut MetadataEntry {
        let idx = self
            .metadata
            .iter()
            .position(|entry| entry.property_name() == Some(name));
        let idx = match idx {
            Some(idx) => idx,
            None => {
                self.metadata.push(MetadataEntry::property(name));
                self.metadata.len() - 1
            }
        };
        &mut self.metadata[idx]
    }

    /// Top-level property names from the schema.
    #[must_use]
    pub fn property_names(&self) -> Vec<String> {
        self.schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// The catalog document: the set of streams a tap exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub streams: Vec<CatalogStream>,
}

impl Catalog {
    /// Parse a catalog from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error on malformed input.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Serialize with the two-space indentation taps conventionally use.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error; cannot fail for this type.
    pub fn to_vec_pretty(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Find a stream by its tap-assigned name.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&CatalogStream> {
        self.streams
            .iter()
            .find(|s| s.tap_stream_name == name)
    }
}
