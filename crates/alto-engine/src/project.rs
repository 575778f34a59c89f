//! Configuration projection.
//!
//! Turns the effective configuration tree into per-plugin and per-pipeline
//! views: fully expanded [`PluginSpec`]s (inheritance resolved), materialized
//! JSON config files in staging, environment-variable sets, and effective
//! load paths. Inheritance is resolved before any accent overlay.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde_json::{Map, Value};

use alto_types::config::{deep_merge, EffectiveConfig};
use alto_types::plugin::{PluginKind, PluginSpec};
use alto_types::{AltoError, Result};

use crate::paths::ProjectLayout;

const KINDS: [PluginKind; 3] = [PluginKind::Tap, PluginKind::Target, PluginKind::Utility];

/// Read-side projection over the effective configuration.
pub struct Projection<'a> {
    config: &'a EffectiveConfig,
}

impl<'a> Projection<'a> {
    #[must_use]
    pub fn new(config: &'a EffectiveConfig) -> Self {
        Self { config }
    }

    /// The underlying effective configuration.
    #[must_use]
    pub fn config(&self) -> &EffectiveConfig {
        self.config
    }

    fn section(&self, kind: PluginKind) -> Option<&Map<String, Value>> {
        self.config.get(kind.section()).and_then(Value::as_object)
    }

    /// Declared plugin names of one kind, in declaration order.
    #[must_use]
    pub fn names(&self, kind: PluginKind) -> Vec<String> {
        self.section(kind)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All plugins of the given kinds (all kinds when empty).
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] when any declaration is malformed.
    pub fn plugins(&self, kinds: &[PluginKind]) -> Result<Vec<PluginSpec>> {
        let kinds = if kinds.is_empty() { &KINDS[..] } else { kinds };
        let mut specs = Vec::new();
        for kind in kinds {
            for name in self.names(*kind) {
                specs.push(self.spec(&name)?);
            }
        }
        Ok(specs)
    }

    /// Raw declaration value and kind for a plugin name, searched across
    /// sections in tap, target, utility order.
    fn raw_spec(&self, name: &str) -> Result<(PluginKind, &Value)> {
        for kind in KINDS {
            if let Some(value) = self.section(kind).and_then(|map| map.get(name)) {
                return Ok((kind, value));
            }
        }
        Err(AltoError::config(
            name,
            format!("plugin `{name}` is not declared"),
        ))
    }

    /// The fully expanded spec for a plugin: `inherit_from` chains are
    /// resolved parent-first (child keys win), then the result parses.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] on an unknown name, an inheritance
    /// cycle, or a malformed declaration.
    pub fn spec(&self, name: &str) -> Result<PluginSpec> {
        let (kind, value) = self.expand(name, &mut Vec::new())?;
        PluginSpec::from_value(name, kind, &value)
    }

    fn expand(&self, name: &str, chain: &mut Vec<String>) -> Result<(PluginKind, Value)> {
        if chain.iter().any(|seen| seen == name) {
            chain.push(name.to_string());
            return Err(AltoError::config(
                format!("{}.inherit_from", chain[0]),
                format!("inheritance cycle: {}", chain.join(" -> ")),
            ));
        }
        chain.push(name.to_string());
        let (kind, value) = self.raw_spec(name)?;
        let parent = value.get("inherit_from").and_then(Value::as_str);
        let merged = match parent {
            Some(parent) => {
                let (_, parent_value) = self.expand(parent, chain)?;
                deep_merge(parent_value, value.clone())
            }
            None => value.clone(),
        };
        Ok((kind, merged))
    }

    /// Effective load path for a plugin: plugin-level when declared,
    /// otherwise the environment-level `load_path`.
    #[must_use]
    pub fn load_path(&self, spec: &PluginSpec) -> Option<String> {
        spec.load_path
            .clone()
            .or_else(|| self.config.get_str("load_path").map(str::to_string))
    }

    /// Environment-variable set for running a plugin: project-level map,
    /// then plugin-level map, then the orchestrator's own markers.
    #[must_use]
    pub fn runtime_env(&self, spec: &PluginSpec) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(project_env) = self.config.get("environment").and_then(Value::as_object) {
            for (key, value) in project_env {
                env.insert(key.clone(), scalar_to_string(value));
            }
        }
        for (key, value) in &spec.environment {
            env.insert(key.clone(), scalar_to_string(value));
        }
        // The artifact is a multi-entry executable; these select the entry.
        let entry_var = if spec.entrypoint.is_some() {
            "ALTO_ENTRYPOINT"
        } else {
            "ALTO_SCRIPT"
        };
        env.insert(entry_var.to_string(), spec.entry().to_string());
        env.insert("ALTO_PLUGIN".to_string(), spec.name.clone());
        if let Some(load_path) = self.load_path(spec) {
            env.insert("ALTO_LOAD_PATH".to_string(), load_path);
        }
        env
    }

    /// Materialize a plugin's JSON configuration into staging.
    ///
    /// For a pipeline, the target is rendered with the tap as `accent`: if
    /// the tap declares an overlay keyed by the target's name, that overlay
    /// is merged into the target's configuration (tap overrides target).
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be written.
    pub fn render_config(
        &self,
        layout: &ProjectLayout,
        spec: &PluginSpec,
        accent: Option<&PluginSpec>,
    ) -> Result<PathBuf> {
        let mut config = Value::Object(spec.config.clone());
        if let Some(accent) = accent {
            if let Some(overlay) = accent.accents.get(&spec.name) {
                config = deep_merge(config, overlay.clone());
            }
        }
        let path = layout.config_path(&spec.name, accent.map(|a| a.name.as_str()))?;
        fs::write(&path, serde_json::to_vec_pretty(&config)?)?;
        tracing::debug!(plugin = spec.name, path = %path.display(), "Rendered plugin configuration");
        Ok(path)
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
