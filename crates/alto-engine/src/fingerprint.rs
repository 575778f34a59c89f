//! Stable fingerprints for plugin artifacts and task inputs.
//!
//! A fingerprint is a 40-hex-digit SHA-1 digest over a canonical encoding
//! of its inputs. It is the sole identity of a cached artifact, so the
//! encoding must be stable across machines and indifferent to map
//! insertion order.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};

use alto_types::plugin::PluginSpec;
use alto_types::Result;

/// Build-environment tags that participate in the plugin fingerprint.
///
/// Two machines with the same tags resolve a spec to the same artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTags {
    /// Interpreter compatibility tag (e.g. `cpython-3.11`).
    pub interpreter: String,
    /// Machine architecture tag (e.g. `linux-x86_64`).
    pub arch: String,
}

impl BuildTags {
    /// Tags for the current machine. The interpreter tag can be pinned via
    /// `ALTO_INTERPRETER_TAG` when the packager targets a specific runtime.
    #[must_use]
    pub fn current() -> Self {
        let interpreter = std::env::var("ALTO_INTERPRETER_TAG")
            .unwrap_or_else(|_| "cpython-3.11".to_string());
        Self {
            interpreter,
            arch: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

fn feed(hasher: &mut Sha1, field: &str) {
    hasher.update(field.as_bytes());
    // NUL separator keeps ("ab","c") distinct from ("a","bc").
    hasher.update([0u8]);
}

/// Fingerprint a plugin specification.
///
/// Inputs, in fixed order: install URL, entrypoint-or-executable,
/// interpreter tag, arch tag, and the optional user cache version.
#[must_use]
pub fn plugin_fingerprint(spec: &PluginSpec, tags: &BuildTags) -> String {
    let mut hasher = Sha1::new();
    feed(&mut hasher, spec.install_url.trim());
    feed(&mut hasher, spec.entry());
    feed(&mut hasher, &tags.interpreter);
    feed(&mut hasher, &tags.arch);
    if let Some(version) = &spec.cache_version {
        feed(&mut hasher, version);
    }
    hex::encode(hasher.finalize())
}

/// Content hash of one file, streamed.
///
/// # Errors
///
/// Returns an I/O error when the file cannot be read.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint a task's declared inputs: the content hash of each input
/// file (missing files hash as absent, so appearing later changes the
/// fingerprint) plus each scalar parameter, keyed and sorted.
///
/// # Errors
///
/// Returns an I/O error when an existing input file cannot be read.
pub fn task_fingerprint(
    files: &[&Path],
    params: &BTreeMap<String, String>,
) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut sorted: Vec<&Path> = files.to_vec();
    sorted.sort();
    for path in sorted {
        feed(&mut hasher, &path.to_string_lossy());
        if path.exists() {
            feed(&mut hasher, &file_digest(path)?);
        } else {
            feed(&mut hasher, "<absent>");
        }
    }
    for (key, value) in params {
        feed(&mut hasher, key);
        feed(&mut hasher, value);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alto_types::plugin::PluginKind;
    use serde_json::json;

    fn tags() -> BuildTags {
        BuildTags {
            interpreter: "cpython-3.11".into(),
            arch: "linux-x86_64".into(),
        }
    }

    fn spec(value: serde_json::Value) -> PluginSpec {
        PluginSpec::from_value("tap-x", PluginKind::Tap, &value).unwrap()
    }

    #[test]
    fn forty_hex_digits() {
        let fp = plugin_fingerprint(&spec(json!({"install_url": "pkg-x==1.0"})), &tags());
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn stable_across_calls_and_config_noise() {
        // The configuration map is not a fingerprint input.
        let a = spec(json!({"install_url": "pkg-x==1.0", "config": {"a": 1, "b": 2}}));
        let b = spec(json!({"install_url": "pkg-x==1.0", "config": {"b": 2, "a": 1}}));
        assert_eq!(
            plugin_fingerprint(&a, &tags()),
            plugin_fingerprint(&b, &tags())
        );
    }

    #[test]
    fn install_url_whitespace_is_trimmed() {
        let a = spec(json!({"install_url": "pkg-x==1.0"}));
        let b = spec(json!({"install_url": "  pkg-x==1.0  "}));
        assert_eq!(
            plugin_fingerprint(&a, &tags()),
            plugin_fingerprint(&b, &tags())
        );
    }

    #[test]
    fn every_declared_input_changes_the_digest() {
        let base = spec(json!({"install_url": "pkg-x==1.0"}));
        let fp = plugin_fingerprint(&base, &tags());

        let other_url = spec(json!({"install_url": "pkg-x==1.1"}));
        assert_ne!(fp, plugin_fingerprint(&other_url, &tags()));

        let other_entry = spec(json!({"install_url": "pkg-x==1.0", "entrypoint": "x:main"}));
        assert_ne!(fp, plugin_fingerprint(&other_entry, &tags()));

        let other_interp = BuildTags {
            interpreter: "cpython-3.12".into(),
            ..tags()
        };
        assert_ne!(fp, plugin_fingerprint(&base, &other_interp));

        let salted = spec(json!({"install_url": "pkg-x==1.0", "cache_version": "2"}));
        assert_ne!(fp, plugin_fingerprint(&salted, &tags()));
    }

    #[test]
    fn task_fingerprint_tracks_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.json");
        std::fs::write(&input, b"{}").unwrap();

        let params = BTreeMap::new();
        let before = task_fingerprint(&[&input], &params).unwrap();
        std::fs::write(&input, b"{\"changed\":true}").unwrap();
        let after = task_fingerprint(&[&input], &params).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn task_fingerprint_indifferent_to_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let params = BTreeMap::new();
        let ab = task_fingerprint(&[&a, &b], &params).unwrap();
        let ba = task_fingerprint(&[&b, &a], &params).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn task_fingerprint_absent_file_differs_from_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maybe");
        let params = BTreeMap::new();
        let absent = task_fingerprint(&[&path], &params).unwrap();
        std::fs::write(&path, b"").unwrap();
        let empty = task_fingerprint(&[&path], &params).unwrap();
        assert_ne!(absent, empty);
    }

    #[test]
    fn task_fingerprint_params_change_digest() {
        let mut params = BTreeMap::new();
        let base = task_fingerprint(&[], &params).unwrap();
        params.insert("select".into(), "*.*".into());
        let with_param = task_fingerprint(&[], &params).unwrap();
        assert_ne!(base, with_param);
    }
}
