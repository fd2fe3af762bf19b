//! Digester conformance tests, driven by YAML fixtures.
//!
//! Each fixture carries an inline `.cdrl` document, an optional table of
//! importable resources, and either an expected outcome or an expected
//! error. Fixture files are multi-document YAML under `tests/fixtures/`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use cedra::prelude::*;

#[derive(Debug, Deserialize)]
struct DigestFixture {
    name: String,
    #[serde(default)]
    description: String,
    config: String,
    /// Base URI the config digests under.
    #[serde(default = "default_base_uri")]
    base_uri: String,
    /// URI -> content, visible to the resource locator.
    #[serde(default)]
    resources: HashMap<String, String>,
    #[serde(default)]
    expect_error: bool,
    /// Substring the rendered error must contain.
    #[serde(default)]
    error_contains: Option<String>,
    #[serde(default)]
    expect: Option<Expectation>,
}

#[derive(Debug, Default, Deserialize)]
struct Expectation {
    #[serde(default)]
    resource_count: Option<usize>,
    /// Selector strings, in sequence order.
    #[serde(default)]
    selectors: Option<Vec<String>>,
    #[serde(default)]
    profile_count: Option<usize>,
    /// `selector -> [param-name=value, ...]` spot checks.
    #[serde(default)]
    params: HashMap<String, Vec<String>>,
}

fn default_base_uri() -> String {
    "conf".to_string()
}

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

fn load_fixtures(path: &Path) -> Vec<DigestFixture> {
    let yaml = fs::read_to_string(path).expect("read fixture file");
    let mut fixtures = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&yaml) {
        fixtures.push(
            DigestFixture::deserialize(doc)
                .unwrap_or_else(|e| panic!("failed to parse {}: {e}", path.display())),
        );
    }
    fixtures
}

fn run_fixture(fixture: &DigestFixture) {
    println!(
        "running fixture: {}{}",
        fixture.name,
        if fixture.description.is_empty() {
            String::new()
        } else {
            format!(" ({})", fixture.description)
        }
    );

    let mut locator = InMemoryResourceLocator::new();
    for (uri, content) in &fixture.resources {
        locator.insert(uri, content);
    }

    let visitors = VisitorRegistry::builder().build();
    let mut extensions = ExtensionDigesters::new();
    let result = digest_config(
        &fixture.config,
        &fixture.base_uri,
        &locator,
        &visitors,
        &mut extensions,
    );

    if fixture.expect_error {
        let err = match result {
            Err(err) => err,
            Ok(seq) => panic!(
                "fixture '{}' expected an error but digested {} resources",
                fixture.name,
                seq.len()
            ),
        };
        if let Some(needle) = &fixture.error_contains {
            let rendered = err.to_string();
            assert!(
                rendered.contains(needle),
                "fixture '{}': error '{rendered}' does not contain '{needle}'",
                fixture.name
            );
        }
        return;
    }

    let seq = result.unwrap_or_else(|e| panic!("fixture '{}' failed: {e}", fixture.name));
    let Some(expect) = &fixture.expect else {
        return;
    };

    if let Some(count) = expect.resource_count {
        assert_eq!(seq.len(), count, "fixture '{}': resource count", fixture.name);
    }
    if let Some(selectors) = &expect.selectors {
        let actual: Vec<String> = seq
            .resource_configs()
            .map(|c| c.selector_path().selector().to_string())
            .collect();
        assert_eq!(&actual, selectors, "fixture '{}': selectors", fixture.name);
    }
    if let Some(count) = expect.profile_count {
        assert_eq!(
            seq.profile_sets().count(),
            count,
            "fixture '{}': profile count",
            fixture.name
        );
    }
    for (selector, params) in &expect.params {
        let config = seq
            .resource_configs()
            .find(|c| c.selector_path().selector() == selector.as_str())
            .unwrap_or_else(|| {
                panic!("fixture '{}': no resource with selector '{selector}'", fixture.name)
            });
        for entry in params {
            let (name, value) = entry
                .split_once('=')
                .unwrap_or_else(|| panic!("bad param spec '{entry}'"));
            let values: Vec<&str> = config.params().all(name).map(|p| p.value.as_str()).collect();
            assert!(
                values.contains(&value),
                "fixture '{}': param '{name}' values {values:?} missing '{value}'",
                fixture.name
            );
        }
    }
}

#[test]
fn digest_fixtures() {
    let dir = fixtures_dir();
    assert!(dir.exists(), "fixtures directory missing: {}", dir.display());

    let mut ran = 0;
    let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
        .expect("read fixtures dir")
        .map(|e| e.expect("dir entry").path())
        .filter(|p| {
            p.extension()
                .map_or(false, |ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    entries.sort();

    for path in entries {
        for fixture in load_fixtures(&path) {
            run_fixture(&fixture);
            ran += 1;
        }
    }
    assert!(ran >= 8, "expected the fixture corpus to run, got {ran}");
}

/// Digesting the same stream twice with the same inputs yields sequences
/// equal in content and order.
#[test]
fn digestion_round_trips_identically() {
    let fixture_path = fixtures_dir().join("digest_basics.yaml");
    for fixture in load_fixtures(&fixture_path) {
        if fixture.expect_error {
            continue;
        }

        let mut locator = InMemoryResourceLocator::new();
        for (uri, content) in &fixture.resources {
            locator.insert(uri, content);
        }
        let visitors = VisitorRegistry::builder().build();

        let digest_once = |extensions: &mut ExtensionDigesters| {
            digest_config(
                &fixture.config,
                &fixture.base_uri,
                &locator,
                &visitors,
                extensions,
            )
            .unwrap()
        };

        let mut extensions = ExtensionDigesters::new();
        let first = digest_once(&mut extensions);
        let second = digest_once(&mut extensions);

        let shape = |seq: &ResourceConfigSeq| {
            seq.resource_configs()
                .map(|c| {
                    (
                        c.selector_path().selector().to_string(),
                        c.resource().map(str::to_string),
                        c.params().len(),
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second), "fixture '{}'", fixture.name);
    }
}
