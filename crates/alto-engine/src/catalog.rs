//! Catalog discovery and the runtime-catalog pipeline.
//!
//! The *base* catalog is exactly what the tap emits under `--discover`,
//! cached on the storage backend keyed by tap name alone. The *runtime*
//! catalog is base plus user overlays, regenerated into staging on every
//! run: selection patterns first, metadata overlays second, and a set of
//! PII-marked field paths handed to the pipeline runner for inline hashing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex::Regex;
use serde_json::Value;

use alto_store::{with_retries, StorageBackend, DEFAULT_MAX_ATTEMPTS};
use alto_types::catalog::{Catalog, CatalogStream};
use alto_types::plugin::PluginSpec;
use alto_types::{AltoError, Result};

use crate::paths::ProjectLayout;

// ---------------------------------------------------------------------------
// Selection patterns
// ---------------------------------------------------------------------------

/// One parsed selection pattern: `[!]?[~]?<stream-glob>.<prop-glob>`.
///
/// A leading `!` excludes, a leading `~` selects and marks the matched
/// fields for PII hashing. The first `.` splits the stream glob from the
/// property glob; a pattern without a dot selects whole streams.
#[derive(Debug)]
pub struct SelectionPattern {
    pub negate: bool,
    pub hash: bool,
    stream_re: Regex,
    prop_re: Regex,
    /// Length of the leading literal run; longer is more specific and wins
    /// ties between a selection and an exclusion.
    specificity: usize,
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|err| AltoError::config("select", err.to_string()))
}

fn literal_prefix_len(pattern: &str) -> usize {
    pattern.chars().take_while(|c| *c != '*' && *c != '?').count()
}

impl SelectionPattern {
    fn parse(raw: &str) -> Result<Self> {
        let mut rest = raw;
        let negate = rest.starts_with('!');
        if negate {
            rest = &rest[1..];
        }
        let hash = rest.starts_with('~');
        if hash {
            rest = &rest[1..];
        }
        if rest.is_empty() {
            return Err(AltoError::config("select", format!("empty pattern `{raw}`")));
        }
        let (stream_glob, prop_glob) = match rest.split_once('.') {
            Some((stream, prop)) => (stream, prop),
            None => (rest, "*"),
        };
        Ok(Self {
            negate,
            hash,
            stream_re: glob_to_regex(stream_glob)?,
            prop_re: glob_to_regex(prop_glob)?,
            specificity: literal_prefix_len(&format!("{stream_glob}.{prop_glob}")),
        })
    }

    fn matches(&self, stream: &str, prop: &str) -> bool {
        self.stream_re.is_match(stream) && self.prop_re.is_match(prop)
    }
}

/// Parse a `select` list with the conventional defaults: an empty list
/// selects everything, and an all-exclusion list gets an implicit `*.*`
/// prepended so the exclusions have something to subtract from.
///
/// # Errors
///
/// Returns [`AltoError::Config`] on an unparsable pattern.
pub fn parse_select_patterns(select: &[String]) -> Result<Vec<SelectionPattern>> {
    let mut raw: Vec<&str> = select.iter().map(String::as_str).collect();
    if raw.is_empty() {
        raw.push("*.*");
    }
    if raw.iter().all(|pattern| pattern.starts_with('!')) {
        raw.insert(0, "*.*");
    }
    raw.iter().map(|pattern| SelectionPattern::parse(pattern)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision {
    Selected,
    Excluded,
    Undecided,
}

fn decide(patterns: &[SelectionPattern], stream: &str, prop: &str) -> (Decision, bool) {
    let mut best_selection: Option<usize> = None;
    let mut best_exclusion: Option<usize> = None;
    let mut hash = false;
    for pattern in patterns {
        if !pattern.matches(stream, prop) {
            continue;
        }
        if pattern.negate {
            best_exclusion = Some(best_exclusion.map_or(pattern.specificity, |s| s.max(pattern.specificity)));
        } else {
            best_selection = Some(best_selection.map_or(pattern.specificity, |s| s.max(pattern.specificity)));
            hash |= pattern.hash;
        }
    }
    let decision = match (best_selection, best_exclusion) {
        (None, None) => Decision::Undecided,
        (Some(_), None) => Decision::Selected,
        (None, Some(_)) => Decision::Excluded,
        // A more specific selection overrides an exclusion; ties exclude.
        (Some(sel), Some(excl)) => {
            if sel > excl {
                Decision::Selected
            } else {
                Decision::Excluded
            }
        }
    };
    (decision, hash && decision == Decision::Selected)
}

/// What the selection pass reports back to the pipeline runner.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectionOutcome {
    /// Stream name to the set of field names marked for PII hashing.
    pub pii_fields: BTreeMap<String, BTreeSet<String>>,
}

impl SelectionOutcome {
    /// Fields to hash for one stream, when any.
    #[must_use]
    pub fn fields_for(&self, stream: &str) -> Option<&BTreeSet<String>> {
        self.pii_fields.get(stream)
    }
}

fn apply_selection_to_stream(
    stream: &mut CatalogStream,
    patterns: &[SelectionPattern],
    outcome: &mut SelectionOutcome,
) {
    let stream_name = stream.tap_stream_name.clone();
    let props = stream.property_names();
    let mut alive = false;

    if props.is_empty() {
        // A stream without declared properties is decided at stream scope;
        // only a match-all property glob reaches it.
        let (decision, _) = decide(patterns, &stream_name, "");
        alive = decision == Decision::Selected;
    }

    for prop in props {
        let (decision, hash) = decide(patterns, &stream_name, &prop);
        let entry = stream.property_metadata_mut(&prop);
        let inclusion = entry.inclusion().map(str::to_string);
        let selected = match inclusion.as_deref() {
            // Unsupported fields stay off no matter what the user asked.
            Some("unsupported") => false,
            // Automatic fields ride along but do not keep a stream alive.
            Some("automatic") => true,
            _ => match decision {
                Decision::Selected => true,
                Decision::Excluded => false,
                Decision::Undecided => entry
                    .metadata
                    .get("selected-by-default")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
        };
        entry.set_selected(selected);
        if selected && inclusion.as_deref() != Some("automatic") {
            alive = true;
        }
        if hash && selected {
            outcome
                .pii_fields
                .entry(stream_name.clone())
                .or_default()
                .insert(prop);
        }
    }

    stream.selected = alive;
    stream.root_metadata_mut().set_selected(alive);
    if !alive {
        outcome.pii_fields.remove(&stream_name);
    }
}

/// Apply selection patterns to a catalog in place.
///
/// Selection is encoded by writing `selected` flags into the stream-root
/// and per-property metadata entries; the schema itself is never pruned,
/// so re-applying the same patterns is idempotent.
///
/// # Errors
///
/// Returns [`AltoError::Config`] on an unparsable pattern.
pub fn apply_selection(catalog: &mut Catalog, select: &[String]) -> Result<SelectionOutcome> {
    let patterns = parse_select_patterns(select)?;
    let mut outcome = SelectionOutcome::default();
    for stream in &mut catalog.streams {
        apply_selection_to_stream(stream, &patterns, &mut outcome);
    }
    Ok(outcome)
}

/// Merge user metadata overlays into matching streams' root entries.
///
/// The `selected` key is reserved for the selection pass and stripped from
/// every overlay. `replication-method` and `replication-key` also update
/// the stream's top-level fields for taps that read the legacy location.
///
/// # Errors
///
/// Returns [`AltoError::Config`] on an unparsable stream glob or a
/// non-map overlay payload.
pub fn apply_metadata(
    catalog: &mut Catalog,
    overlays: &serde_json::Map<String, Value>,
) -> Result<()> {
    for (pattern, payload) in overlays {
        let Some(payload) = payload.as_object() else {
            return Err(AltoError::config(
                format!("metadata.{pattern}"),
                "overlay payload must be a map",
            ));
        };
        let mut payload = payload.clone();
        payload.remove("selected");
        let stream_re = glob_to_regex(pattern)?;
        for stream in &mut catalog.streams {
            if !stream_re.is_match(&stream.tap_stream_name) {
                continue;
            }
            if let Some(method) = payload.get("replication-method").and_then(Value::as_str) {
                stream.replication_method = Some(method.to_string());
            }
            if let Some(key) = payload.get("replication-key").and_then(Value::as_str) {
                stream.replication_key = Some(key.to_string());
            }
            let root = stream.root_metadata_mut();
            for (key, value) in &payload {
                root.metadata.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Base-catalog discovery and caching
// ---------------------------------------------------------------------------

/// Run a tap in discovery mode and cache the result.
///
/// The cache key is the tap *name*, deliberately not the fingerprint: a
/// changed install URL under an unchanged name keeps serving the cached
/// discovery output until `clean catalog:<tap>` resets it.
///
/// # Errors
///
/// Returns [`AltoError::Discovery`] when the process exits non-zero or
/// emits nothing; the cache is not written in that case.
pub fn discover_base_catalog(
    store: &dyn StorageBackend,
    layout: &ProjectLayout,
    tap: &PluginSpec,
    exe: &Path,
    config_path: &Path,
    env: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let output = Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("--discover")
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| AltoError::Discovery {
            tap: tap.name.clone(),
            message: format!("failed to launch tap: {err}"),
        })?;

    if !output.status.success() {
        return Err(AltoError::Discovery {
            tap: tap.name.clone(),
            message: format!(
                "discovery exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    if output.stdout.is_empty() {
        return Err(AltoError::Discovery {
            tap: tap.name.clone(),
            message: "discovery produced no output".to_string(),
        });
    }

    let local = layout.base_catalog_path(&tap.name)?;
    fs::write(&local, &output.stdout)?;
    let key = ProjectLayout::remote_base_catalog_key(&tap.name);
    with_retries("catalogs.put", DEFAULT_MAX_ATTEMPTS, || {
        store.put(&key, &output.stdout)
    })?;
    tracing::info!(tap = tap.name, bytes = output.stdout.len(), "Base catalog discovered and cached");
    Ok(local)
}

/// Copy the cached base catalog into staging, when the cache has one.
///
/// # Errors
///
/// Returns a storage error on retrieval failure.
pub fn fetch_base_catalog(
    store: &dyn StorageBackend,
    layout: &ProjectLayout,
    tap: &str,
) -> Result<Option<PathBuf>> {
    let key = ProjectLayout::remote_base_catalog_key(tap);
    let exists = with_retries("catalogs.exists", DEFAULT_MAX_ATTEMPTS, || store.exists(&key))?;
    if !exists {
        return Ok(None);
    }
    let bytes = with_retries("catalogs.get", DEFAULT_MAX_ATTEMPTS, || store.get(&key))?;
    let local = layout.base_catalog_path(tap)?;
    fs::write(&local, bytes)?;
    Ok(Some(local))
}

/// Drop a tap's cached base catalog.
///
/// # Errors
///
/// Returns a storage error on removal failure.
pub fn clean_base_catalog(store: &dyn StorageBackend, tap: &str) -> Result<()> {
    let key = ProjectLayout::remote_base_catalog_key(tap);
    if store.exists(&key)? {
        store.remove(&key)?;
    }
    Ok(())
}

/// Produce the runtime catalog for a tap: clone the base, apply selection,
/// then metadata overlays, and write the result into staging.
///
/// # Errors
///
/// Returns [`AltoError::Config`] on bad patterns or overlays, or
/// [`AltoError::Serde`] when the base catalog does not parse.
pub fn render_runtime_catalog(
    layout: &ProjectLayout,
    tap: &PluginSpec,
    base_path: &Path,
) -> Result<(PathBuf, SelectionOutcome)> {
    let mut catalog = Catalog::from_slice(&fs::read(base_path)?)?;
    let outcome = apply_selection(&mut catalog, &tap.select)?;
    apply_metadata(&mut catalog, &tap.metadata)?;
    let path = layout.catalog_path(&tap.name)?;
    fs::write(&path, catalog.to_vec_pretty()?)?;
    tracing::debug!(
        tap = tap.name,
        streams = catalog.streams.len(),
        selected = catalog.streams.iter().filter(|s| s.selected).count(),
        "Rendered runtime catalog"
    );
    Ok((path, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> Catalog {
        serde_json::from_value(json!({
            "streams": [
                {
                    "tap_stream_id": "orders",
                    "schema": {"type": "object", "properties": {
                        "id": {"type": "integer"},
                        "amount": {"type": "number"},
                        "secret_field": {"type": "string"}
                    }},
                    "metadata": [
                        {"breadcrumb": [], "metadata": {"inclusion": "available"}},
                        {"breadcrumb": ["properties", "id"], "metadata": {"inclusion": "automatic"}}
                    ]
                },
                {
                    "tap_stream_id": "customers",
                    "schema": {"type": "object", "properties": {
                        "id": {"type": "integer"},
                        "email": {"type": "string"}
                    }},
                    "metadata": []
                }
            ]
        }))
        .unwrap()
    }

    fn selected(catalog: &Catalog, stream: &str, prop: &str) -> Option<bool> {
        catalog
            .stream(stream)
            .unwrap()
            .metadata
            .iter()
            .find(|e| e.property_name() == Some(prop))
            .and_then(|e| e.selected())
    }

    fn strings(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn select_all_with_one_exclusion() {
        let mut cat = catalog();
        apply_selection(&mut cat, &strings(&["*.*", "!orders.secret_field"])).unwrap();
        let orders = cat.stream("orders").unwrap();
        assert!(orders.selected);
        assert_eq!(orders.root_metadata().unwrap().selected(), Some(true));
        assert_eq!(selected(&cat, "orders", "amount"), Some(true));
        assert_eq!(selected(&cat, "orders", "secret_field"), Some(false));
        assert_eq!(selected(&cat, "customers", "email"), Some(true));
    }

    #[test]
    fn all_exclusions_imply_select_all_first() {
        let mut cat = catalog();
        apply_selection(&mut cat, &strings(&["!customers.*"])).unwrap();
        assert!(cat.stream("orders").unwrap().selected);
        assert!(!cat.stream("customers").unwrap().selected);
    }

    #[test]
    fn empty_select_selects_everything() {
        let mut cat = catalog();
        apply_selection(&mut cat, &[]).unwrap();
        assert!(cat.stream("orders").unwrap().selected);
        assert!(cat.stream("customers").unwrap().selected);
    }

    #[test]
    fn more_specific_selection_beats_exclusion() {
        let mut cat = catalog();
        apply_selection(&mut cat, &strings(&["!orders.*", "orders.amount", "customers.*"])).unwrap();
        assert_eq!(selected(&cat, "orders", "amount"), Some(true));
        assert_eq!(selected(&cat, "orders", "secret_field"), Some(false));
        assert!(cat.stream("orders").unwrap().selected);
    }

    #[test]
    fn tilde_marks_pii_fields() {
        let mut cat = catalog();
        let outcome =
            apply_selection(&mut cat, &strings(&["orders.*", "~customers.email", "customers.id"]))
                .unwrap();
        assert_eq!(selected(&cat, "customers", "email"), Some(true));
        let fields = outcome.fields_for("customers").unwrap();
        assert!(fields.contains("email"));
        assert!(!fields.contains("id"));
        assert!(outcome.fields_for("orders").is_none());
    }

    #[test]
    fn excluded_fields_are_never_pii_marked() {
        let mut cat = catalog();
        let outcome =
            apply_selection(&mut cat, &strings(&["*.*", "~customers.email", "!customers.email"]))
                .unwrap();
        // The exclusion is as specific as the hash selection; exclusion wins.
        assert_eq!(selected(&cat, "customers", "email"), Some(false));
        assert!(outcome.fields_for("customers").is_none());
    }

    #[test]
    fn automatic_inclusion_rides_along_but_does_not_keep_stream() {
        let mut cat = catalog();
        // Only the automatic `orders.id` matches nothing; every pattern
        // points at customers.
        apply_selection(&mut cat, &strings(&["customers.*"])).unwrap();
        let orders = cat.stream("orders").unwrap();
        assert!(!orders.selected);
        // The automatic field still carries selected=true for the tap.
        assert_eq!(selected(&cat, "orders", "id"), Some(true));
    }

    #[test]
    fn unsupported_inclusion_stays_off() {
        let mut cat = catalog();
        cat.streams[0]
            .property_metadata_mut("amount")
            .metadata
            .insert("inclusion".into(), json!("unsupported"));
        apply_selection(&mut cat, &strings(&["orders.*"])).unwrap();
        assert_eq!(selected(&cat, "orders", "amount"), Some(false));
    }

    #[test]
    fn selection_is_idempotent() {
        let mut once = catalog();
        let select = strings(&["*.*", "!orders.secret_field", "~customers.email"]);
        apply_selection(&mut once, &select).unwrap();
        let mut twice = once.clone();
        let outcome = apply_selection(&mut twice, &select).unwrap();
        assert_eq!(once, twice);
        assert!(outcome.fields_for("customers").unwrap().contains("email"));
    }

    #[test]
    fn metadata_overlay_merges_and_bubbles_replication() {
        let mut cat = catalog();
        apply_selection(&mut cat, &[]).unwrap();
        let overlays = match json!({
            "orders": {
                "replication-method": "INCREMENTAL",
                "replication-key": "id",
                "selected": false,
                "custom-flag": true
            }
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        apply_metadata(&mut cat, &overlays).unwrap();
        let orders = cat.stream("orders").unwrap();
        assert_eq!(orders.replication_method.as_deref(), Some("INCREMENTAL"));
        assert_eq!(orders.replication_key.as_deref(), Some("id"));
        let root = orders.root_metadata().unwrap();
        assert_eq!(root.metadata.get("custom-flag"), Some(&json!(true)));
        // The reserved key cannot be smuggled in through an overlay.
        assert_eq!(root.selected(), Some(true));
        // Untouched streams keep their metadata.
        assert!(cat.stream("customers").unwrap().root_metadata().is_some());
    }

    #[test]
    fn metadata_overlay_rejects_non_map_payload() {
        let mut cat = catalog();
        let overlays = match json!({"orders": "not-a-map"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert!(apply_metadata(&mut cat, &overlays).is_err());
    }

    #[test]
    fn glob_specificity_is_literal_prefix_length() {
        assert_eq!(literal_prefix_len("*.*"), 0);
        assert_eq!(literal_prefix_len("orders.*"), 7);
        assert_eq!(literal_prefix_len("orders.secret_field"), 19);
    }

    #[test]
    fn stream_without_properties_decided_at_stream_scope() {
        let mut cat: Catalog = serde_json::from_value(json!({
            "streams": [{"tap_stream_id": "heartbeat", "schema": {"type": "object"}, "metadata": []}]
        }))
        .unwrap();
        apply_selection(&mut cat, &strings(&["*.*"])).unwrap();
        assert!(cat.stream("heartbeat").unwrap().selected);

        let mut cat2: Catalog = serde_json::from_value(json!({
            "streams": [{"tap_stream_id": "heartbeat", "schema": {"type": "object"}, "metadata": []}]
        }))
        .unwrap();
        apply_selection(&mut cat2, &strings(&["orders.*"])).unwrap();
        assert!(!cat2.stream("heartbeat").unwrap().selected);
    }
}
