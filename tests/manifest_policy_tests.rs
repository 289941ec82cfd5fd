#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for Setlink.
//!
//! These tests verify that Cargo.toml keeps the lint levels, feature gates
//! and demo targets the project relies on. If any test fails, the manifest
//! has drifted from the agreed-upon policy.
//!
//! All checks are synchronous filesystem reads.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Parses Cargo.toml into a table.
fn manifest() -> toml::Table {
    let path = project_root().join("Cargo.toml");
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    toml::from_str::<toml::Table>(&text)
        .unwrap_or_else(|e| panic!("Cargo.toml is not valid TOML: {e}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_denies_all_panic_prone_lints() {
        let manifest = manifest();
        let clippy = manifest["lints"]["clippy"]
            .as_table()
            .expect("Cargo.toml is missing a [lints.clippy] section");

        for lint in REQUIRED_DENY_LINTS {
            assert_eq!(
                clippy.get(*lint).and_then(toml::Value::as_str),
                Some("deny"),
                "Cargo.toml must set `{lint} = \"deny\"` in [lints.clippy] to keep \
                 library code panic-free."
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    #[test]
    fn http_relay_is_default_and_gates_reqwest() {
        let manifest = manifest();
        let features = manifest["features"].as_table().unwrap();
        let default: Vec<&str> = features["default"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert!(
            default.contains(&"relay-http"),
            "relay-http must stay a default feature"
        );

        let gate: Vec<&str> = features["relay-http"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(gate, vec!["dep:reqwest"]);

        let reqwest = &manifest["dependencies"]["reqwest"];
        assert_eq!(
            reqwest.get("optional").and_then(toml::Value::as_bool),
            Some(true),
            "reqwest must only be pulled in by the relay-http feature"
        );
    }

    #[test]
    fn webrtc_transport_is_default_and_gates_webrtc() {
        let manifest = manifest();
        let features = manifest["features"].as_table().unwrap();
        let default = features["default"].as_array().unwrap();
        assert!(
            default.iter().any(|f| f.as_str() == Some("transport-webrtc")),
            "transport-webrtc must stay a default feature"
        );
        let gate: Vec<&str> = features["transport-webrtc"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(gate, vec!["dep:webrtc"]);
        assert_eq!(
            manifest["dependencies"]["webrtc"]
                .get("optional")
                .and_then(toml::Value::as_bool),
            Some(true),
            "webrtc must only be pulled in by the transport-webrtc feature"
        );
    }

    #[test]
    fn runtime_dependency_uses_minimal_tokio_features() {
        let manifest = manifest();
        let features: Vec<&str> = manifest["dependencies"]["tokio"]["features"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert!(
            !features.contains(&"full"),
            "library builds must not enable tokio's `full` feature"
        );
        for needed in ["sync", "macros", "rt", "time"] {
            assert!(features.contains(&needed), "tokio feature `{needed}` is required");
        }
    }

    #[test]
    fn msrv_is_declared() {
        let manifest = manifest();
        let version = manifest["package"]["rust-version"]
            .as_str()
            .expect("Cargo.toml must declare a rust-version");
        assert!(version.split('.').count() >= 2, "rust-version looks malformed: {version}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: demo_targets
// ─────────────────────────────────────────────────────────────────────────────

mod demo_targets {
    use super::*;

    #[test]
    fn every_declared_demo_exists() {
        let manifest = manifest();
        let examples = manifest["example"]
            .as_array()
            .expect("Cargo.toml must declare [[example]] targets");
        assert!(!examples.is_empty());
        for example in examples {
            let path = example["path"].as_str().unwrap();
            assert!(
                project_root().join(path).is_file(),
                "demo target '{path}' is declared in Cargo.toml but missing"
            );
        }
    }

    #[test]
    fn http_demo_requires_the_http_relay() {
        let manifest = manifest();
        let examples = manifest["example"].as_array().unwrap();
        let browser = examples
            .iter()
            .find(|e| e["name"].as_str() == Some("lobby_browser"))
            .expect("lobby_browser demo must be declared");
        let required: Vec<&str> = browser["required-features"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(required, vec!["relay-http"]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: packaging
// ─────────────────────────────────────────────────────────────────────────────

mod packaging {
    use super::*;

    #[test]
    fn every_included_file_exists() {
        let manifest = manifest();
        let include = manifest["package"]["include"]
            .as_array()
            .expect("Cargo.toml must declare package.include");
        for entry in include.iter().filter_map(toml::Value::as_str) {
            if entry.contains('*') {
                continue;
            }
            let path = project_root().join(entry.trim_start_matches('/'));
            assert!(
                path.is_file(),
                "package.include lists '{entry}' but the file does not exist"
            );
        }
    }

    #[test]
    fn readme_exists() {
        let manifest = manifest();
        let readme = manifest["package"]["readme"].as_str().unwrap();
        assert!(project_root().join(readme).is_file());
    }
}
