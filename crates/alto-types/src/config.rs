//! Layered configuration tree.
//!
//! The engine consumes an already-parsed, already-interpolated tree of
//! JSON-like values. A project file declares one map per environment; the
//! `default` overlay is always applied first and a named overlay, selected
//! by the `ALTO_ENV` variable, is deep-merged over it.

use serde_json::{Map, Value};

use crate::error::{AltoError, Result};

/// Name of the overlay that is always applied first.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Deep-merge `overlay` into `base`, returning the merged tree.
///
/// Maps merge key-wise (recursing into nested maps), sequences concatenate
/// (base elements first), and any other pairing replaces the base value.
#[must_use]
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map;
            for (key, value) in overlay_map {
                match merged.remove(&key) {
                    Some(existing) => {
                        merged.insert(key, deep_merge(existing, value));
                    }
                    None => {
                        merged.insert(key, value);
                    }
                }
            }
            Value::Object(merged)
        }
        (Value::Array(mut base_seq), Value::Array(overlay_seq)) => {
            base_seq.extend(overlay_seq);
            Value::Array(base_seq)
        }
        (_, overlay) => overlay,
    }
}

/// The effective configuration for one environment.
///
/// Produced by [`resolve_environment`]; everything downstream (projection,
/// task discovery) reads from this and never from the raw layered file.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    /// Environment name the tree was resolved for.
    pub env: String,
    /// The merged configuration map.
    pub tree: Map<String, Value>,
}

impl EffectiveConfig {
    /// Look up a top-level key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.tree.get(key)
    }

    /// Look up a top-level string value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.tree.get(key).and_then(Value::as_str)
    }

    /// Project name; required by the layout and the artifact cache.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] when `project_name` is missing.
    pub fn project_name(&self) -> Result<&str> {
        self.get_str("project_name")
            .ok_or_else(|| AltoError::config("project_name", "missing required field"))
    }
}

/// Resolve the effective configuration from a layered tree.
///
/// `layered` is a map of environment name to overlay map. The `default`
/// overlay is applied first; when `env` names anything else, that overlay is
/// deep-merged on top.
///
/// # Errors
///
/// Returns [`AltoError::Config`] when `env` is neither `default` nor a
/// declared overlay, or when an overlay is not a map.
pub fn resolve_environment(layered: &Map<String, Value>, env: &str) -> Result<EffectiveConfig> {
    let base = overlay_map(layered, DEFAULT_ENVIRONMENT)?.unwrap_or_default();
    let tree = if env == DEFAULT_ENVIRONMENT {
        base
    } else {
        let Some(overlay) = overlay_map(layered, env)? else {
            return Err(AltoError::config(
                env,
                format!("environment `{env}` is not declared in the configuration"),
            ));
        };
        match deep_merge(Value::Object(base), Value::Object(overlay)) {
            Value::Object(map) => map,
            _ => unreachable!("merging two maps yields a map"),
        }
    };
    Ok(EffectiveConfig {
        env: env.to_string(),
        tree,
    })
}

fn overlay_map(layered: &Map<String, Value>, env: &str) -> Result<Option<Map<String, Value>>> {
    match layered.get(env) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(AltoError::config(
            env,
            "environment overlay must be a map",
        )),
    }
}
