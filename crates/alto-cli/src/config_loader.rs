//! Project-file loading: locate `alto.yaml`, substitute `${VAR}`
//! references, layer in the secrets file, and resolve the active
//! environment overlay.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use alto_types::config::{deep_merge, resolve_environment, EffectiveConfig};

/// Environment variable naming the active overlay.
pub const ENV_SWITCH: &str = "ALTO_ENV";
/// The overlay applied when `ALTO_ENV` is unset.
pub const DEFAULT_ENV: &str = "default";

const CONFIG_STEMS: [&str; 3] = ["alto.yaml", "alto.yml", "alto.json"];
const SECRET_STEMS: [&str; 3] = ["alto.secrets.yaml", "alto.secrets.yml", "alto.secrets.json"];

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();
    for capture in ENV_VAR_RE.captures_iter(input) {
        let var_name = &capture[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&capture[0], &value);
            }
            Err(_) => missing.push(var_name.to_string()),
        }
    }
    if !missing.is_empty() {
        bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(result)
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| dir.join(name)).find(|p| p.is_file())
}

/// Walk up from `start` to the directory containing a project file.
///
/// # Errors
///
/// Returns an error when no ancestor holds one.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if first_existing(&dir, &CONFIG_STEMS).is_some() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!(
                "no alto.yaml found in {} or any parent directory; run `alto init` to create one",
                start.display()
            );
        }
    }
}

fn load_layered_file(path: &Path) -> Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let substituted = substitute_env_vars(&raw)?;
    let value: Value = serde_yaml::from_str(&substituted)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must hold a map of environment overlays", path.display()),
    }
}

/// Load the layered project tree: the config file deep-merged with the
/// secrets file when one exists.
///
/// # Errors
///
/// Returns an error when the files are unreadable or unparsable.
pub fn load_layered(root: &Path) -> Result<Map<String, Value>> {
    let config_path = first_existing(root, &CONFIG_STEMS)
        .with_context(|| format!("no project file under {}", root.display()))?;
    let mut layered = load_layered_file(&config_path)?;
    if let Some(secrets_path) = first_existing(root, &SECRET_STEMS) {
        let secrets = load_layered_file(&secrets_path)?;
        layered = match deep_merge(Value::Object(layered), Value::Object(secrets)) {
            Value::Object(map) => map,
            _ => unreachable!("merging two maps yields a map"),
        };
    }
    Ok(layered)
}

/// The active environment name from `ALTO_ENV`.
#[must_use]
pub fn active_env() -> String {
    std::env::var(ENV_SWITCH).unwrap_or_else(|_| DEFAULT_ENV.to_string())
}

/// Load and resolve the effective configuration for a project root.
///
/// # Errors
///
/// Returns an error on unreadable files or an undeclared environment.
pub fn load_effective(root: &Path, env: &str) -> Result<EffectiveConfig> {
    let layered = load_layered(root)?;
    Ok(resolve_environment(&layered, env)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_vars_and_reports_missing_ones() {
        std::env::set_var("ALTO_TEST_HOST", "db.internal");
        let out = substitute_env_vars("host: ${ALTO_TEST_HOST}").unwrap();
        assert_eq!(out, "host: db.internal");
        std::env::remove_var("ALTO_TEST_HOST");

        let err = substitute_env_vars("${ALTO_TEST_NOPE_1} ${ALTO_TEST_NOPE_2}").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ALTO_TEST_NOPE_1"));
        assert!(msg.contains("ALTO_TEST_NOPE_2"));
    }

    #[test]
    fn finds_project_root_upwards() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("alto.yaml"), "default:\n  project_name: demo\n")
            .unwrap();
        let root = find_project_root(&nested).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn missing_project_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A bare temp dir has no alto.yaml anywhere up to the root in
        // practice, but guard the walk by asserting the error message.
        if find_project_root(dir.path()).is_ok() {
            // An alto.yaml exists in a parent of the temp dir on this
            // machine; nothing to assert.
            return;
        }
        let err = find_project_root(dir.path()).unwrap_err();
        assert!(err.to_string().contains("alto init"));
    }

    #[test]
    fn secrets_merge_over_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("alto.yaml"),
            "default:\n  project_name: demo\n  taps:\n    tap-x:\n      install_url: pkg-x==1.0\n      config:\n        user: alice\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("alto.secrets.yaml"),
            "default:\n  taps:\n    tap-x:\n      config:\n        password: hunter2\n",
        )
        .unwrap();
        let effective = load_effective(dir.path(), "default").unwrap();
        let tap = &effective.tree["taps"]["tap-x"]["config"];
        assert_eq!(tap["user"], "alice");
        assert_eq!(tap["password"], "hunter2");
    }

    #[test]
    fn environment_overlay_resolves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("alto.yaml"),
            "default:\n  project_name: demo\n  load_path: raw\nprod:\n  load_path: analytics\n",
        )
        .unwrap();
        let effective = load_effective(dir.path(), "prod").unwrap();
        assert_eq!(effective.get_str("load_path"), Some("analytics"));
        assert_eq!(effective.get_str("project_name"), Some("demo"));
    }
}
