//! Plugin specification model.
//!
//! A [`PluginSpec`] is one declaration under the `taps`, `targets`, or
//! `utilities` map of the effective configuration. Inheritance
//! (`inherit_from`) and accent overlays are *declared* here and resolved by
//! the projection layer in the engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AltoError, Result};

/// The three plugin families the orchestrator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Tap,
    Target,
    Utility,
}

impl PluginKind {
    /// Configuration-file section name for this kind.
    #[must_use]
    pub fn section(self) -> &'static str {
        match self {
            Self::Tap => "taps",
            Self::Target => "targets",
            Self::Utility => "utilities",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tap => "tap",
            Self::Target => "target",
            Self::Utility => "utility",
        };
        f.write_str(s)
    }
}

/// Capabilities a Singer plugin may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accepts `--state` with a bookmark document.
    State,
    /// Accepts `--catalog` with a runtime catalog.
    Catalog,
    /// Legacy taps that accept `--properties` instead of `--catalog`.
    Properties,
    /// Supports `--about` self-description.
    About,
    /// Supports `--test` connection checks.
    Test,
}

/// A user-supplied stream-map filter.
///
/// The contract is pinned: an executable launched once per pipeline that
/// consumes newline-delimited Singer messages on stdin and emits the same
/// format on stdout, exiting 0 on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMapSpec {
    /// Path to the filter executable, relative to the project root.
    pub path: String,
    /// Extra arguments passed to the filter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// A plugin declaration from the effective configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Unique name within its kind; injected from the section key.
    #[serde(skip)]
    pub name: String,
    /// Plugin family; injected from the section.
    #[serde(skip)]
    pub kind: PluginKind,

    /// Location the package installer understands: local path, archive URL,
    /// or version-constrained package name.
    #[serde(default)]
    pub install_url: String,
    /// Executable/script name inside the built artifact; defaults to the
    /// plugin name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    /// In-package callable address overriding the executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    /// Advertised Singer capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
    /// Opaque configuration map handed to the plugin as its config file.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Selection patterns: `[!]?[~]?<stream-glob>.<prop-glob>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    /// Metadata overlays: stream glob to a map merged into the root
    /// metadata entry of matching streams.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Stream-map filter declarations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_maps: Vec<StreamMapSpec>,
    /// Plugin-level environment variables.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub environment: Map<String, Value>,
    /// Logical destination partition (schema, dataset, directory). A tap
    /// combined with a target contributes its load path to the pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_path: Option<String>,
    /// Per-target accent overlays keyed by target name; merged into that
    /// target's configuration when this tap runs against it.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub accents: Map<String, Value>,
    /// Name of another spec this one layers on top of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_from: Option<String>,
    /// User-controlled cache-busting salt for the built artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_version: Option<String>,
    /// Declares a target safe for parallel reservoir replay.
    #[serde(default)]
    pub idempotent: bool,
}

impl Default for PluginKind {
    fn default() -> Self {
        Self::Utility
    }
}

impl PluginSpec {
    /// Deserialize a spec from its configuration map, injecting the name
    /// and kind from the surrounding section.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] when the map does not deserialize.
    pub fn from_value(name: &str, kind: PluginKind, value: &Value) -> Result<Self> {
        let mut spec: Self = serde_json::from_value(value.clone()).map_err(|e| {
            AltoError::config(format!("{}.{name}", kind.section()), e.to_string())
        })?;
        spec.name = name.to_string();
        spec.kind = kind;
        Ok(spec)
    }

    /// Executable name inside the artifact; falls back to the plugin name.
    #[must_use]
    pub fn executable_name(&self) -> &str {
        self.executable.as_deref().unwrap_or(&self.name)
    }

    /// Entrypoint when declared, otherwise the executable name.
    #[must_use]
    pub fn entry(&self) -> &str {
        self.entrypoint.as_deref().unwrap_or_else(|| self.executable_name())
    }

    /// Whether the plugin advertises a capability.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
