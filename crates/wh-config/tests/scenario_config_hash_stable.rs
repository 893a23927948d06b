//! Config hash stability: canonicalization must make the hash depend only
//! on content, never on source key order, and merged layers must be
//! deterministic and override-correct.

use wh_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
scheduler:
  partition_count: 10000
  lease_seconds: 300
database:
  pool_size: 10
"#;

/// Same content as BASE_YAML but with keys in different order.
const BASE_YAML_REORDERED: &str = r#"
database:
  pool_size: 10
scheduler:
  lease_seconds: 300
  partition_count: 10000
"#;

const OVERLAY_YAML: &str = r#"
scheduler:
  lease_seconds: 60
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "same YAML input must produce identical hash");
    assert_eq!(a.canonical_json, b.canonical_json, "canonical JSON must be identical for same input");
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(
        original.config_hash, reordered.config_hash,
        "reordering keys in YAML must not change the hash (canonicalization)"
    );
}

#[test]
fn different_values_produce_different_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    let modified = r#"
scheduler:
  partition_count: 20000
  lease_seconds: 120
database:
  pool_size: 10
"#;
    let b = load_layered_yaml_from_strings(&[modified]).unwrap();

    assert_ne!(a.config_hash, b.config_hash, "different config values must produce different hashes");
}

#[test]
fn merged_layers_produce_stable_hash_and_apply_overlay() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "same merge layers must produce identical hash");

    let lease = a.config_json.pointer("/scheduler/lease_seconds").and_then(|v| v.as_i64()).unwrap();
    assert_eq!(lease, 60, "overlay should override base lease_seconds");

    let partitions = a.config_json.pointer("/scheduler/partition_count").and_then(|v| v.as_i64()).unwrap();
    assert_eq!(partitions, 10_000, "overlay must not clobber keys it doesn't mention");
}

#[test]
fn hash_is_64_hex_chars() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(loaded.config_hash.len(), 64, "SHA-256 hash should be 64 hex chars");
    assert!(loaded.config_hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn empty_config_produces_stable_hash() {
    let a = load_layered_yaml_from_strings(&["{}"]).unwrap();
    let b = load_layered_yaml_from_strings(&["{}"]).unwrap();
    assert_eq!(a.config_hash, b.config_hash, "empty configs must produce identical hash");
}
