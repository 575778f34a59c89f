//! Property tests for fingerprint stability.

use proptest::prelude::*;

use alto_engine::{plugin_fingerprint, BuildTags};
use alto_types::plugin::{PluginKind, PluginSpec};

fn tags() -> BuildTags {
    BuildTags {
        interpreter: "cpython-3.11".into(),
        arch: "linux-x86_64".into(),
    }
}

fn spec_with(install_url: &str, config: serde_json::Value) -> PluginSpec {
    PluginSpec::from_value(
        "tap-x",
        PluginKind::Tap,
        &serde_json::json!({"install_url": install_url, "config": config}),
    )
    .unwrap()
}

proptest! {
    /// The configuration map is not a fingerprint input, so arbitrary
    /// config contents (and their insertion order) never move the digest.
    #[test]
    fn fingerprint_ignores_config_contents(
        keys in proptest::collection::vec("[a-z]{1,8}", 0..6),
        values in proptest::collection::vec(0i64..1000, 0..6),
    ) {
        let mut forward = serde_json::Map::new();
        for (k, v) in keys.iter().zip(values.iter()) {
            forward.insert(k.clone(), serde_json::json!(v));
        }
        let mut reversed = serde_json::Map::new();
        for (k, v) in keys.iter().zip(values.iter()).rev() {
            reversed.insert(k.clone(), serde_json::json!(v));
        }
        let a = spec_with("pkg-x==1.0", serde_json::Value::Object(forward));
        let b = spec_with("pkg-x==1.0", serde_json::Value::Object(reversed));
        let empty = spec_with("pkg-x==1.0", serde_json::json!({}));
        prop_assert_eq!(plugin_fingerprint(&a, &tags()), plugin_fingerprint(&b, &tags()));
        prop_assert_eq!(plugin_fingerprint(&a, &tags()), plugin_fingerprint(&empty, &tags()));
    }

    /// Distinct install URLs never collide in practice and always produce
    /// 40 hex digits.
    #[test]
    fn fingerprint_shape_and_url_sensitivity(url_a in "[a-z0-9=.-]{1,30}", url_b in "[a-z0-9=.-]{1,30}") {
        prop_assume!(url_a.trim() != url_b.trim());
        prop_assume!(!url_a.trim().is_empty() && !url_b.trim().is_empty());
        let a = plugin_fingerprint(&spec_with(&url_a, serde_json::json!({})), &tags());
        let b = plugin_fingerprint(&spec_with(&url_b, serde_json::json!({})), &tags());
        prop_assert_eq!(a.len(), 40);
        prop_assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_ne!(a, b);
    }
}
