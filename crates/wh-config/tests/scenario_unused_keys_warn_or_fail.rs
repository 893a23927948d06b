use wh_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigMode, UnusedKeyPolicy};

#[test]
fn warn_mode_reports_unused_keys_without_error() {
    let yaml = r#"
scheduler:
  lease_seconds: 300
database:
  pool_size: 10
unused_section:
  foo: 123
  bar: 456
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::PublisherOnly, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert!(!report.is_clean(), "report should detect unused keys");
    assert!(report.unused_leaf_pointers.contains(&"/unused_section/foo".to_string()));
    assert!(report.unused_leaf_pointers.contains(&"/unused_section/bar".to_string()));
}

#[test]
fn fail_mode_errors_on_unused_keys() {
    let yaml = r#"
scheduler:
  lease_seconds: 300
database:
  pool_size: 10
unused_section:
  foo: 1
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let result = report_unused_keys(ConfigMode::Coordinator, &loaded.config_json, UnusedKeyPolicy::Fail);

    assert!(result.is_err(), "fail policy must error when unused keys exist");
    let msg = format!("{:?}", result.err().unwrap());
    assert!(msg.contains("CONFIG_UNUSED_KEYS"));
}

#[test]
fn only_consumed_keys_are_clean_in_publisher_only_mode() {
    let yaml = r#"
scheduler:
  lease_seconds: 300
database:
  pool_size: 10
publisher:
  batch_size: 50
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::PublisherOnly, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert!(report.is_clean(), "config should be clean when it only uses consumed keys");
}

#[test]
fn perspective_section_is_unused_in_publisher_only_mode() {
    let yaml = r#"
scheduler:
  lease_seconds: 300
database:
  pool_size: 10
perspective:
  batch_size: 50
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::PublisherOnly, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert!(report.unused_leaf_pointers.contains(&"/perspective/batch_size".to_string()));
}

#[test]
fn exact_prefix_match_does_not_consume_similarly_named_sibling_sections() {
    // "/scheduler_extra" must not be treated as under "/scheduler".
    let yaml = r#"
scheduler:
  lease_seconds: 300
database:
  pool_size: 10
scheduler_extra:
  foo: 1
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::Coordinator, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert!(report.unused_leaf_pointers.contains(&"/scheduler_extra/foo".to_string()));
}

#[test]
fn deterministic_unused_pointer_ordering() {
    let yaml = r#"
scheduler:
  lease_seconds: 300
database:
  pool_size: 10
unused:
  b: 2
  a: 1
"#;

    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");
    let report = report_unused_keys(ConfigMode::Coordinator, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert_eq!(
        report.unused_leaf_pointers,
        vec!["/unused/a".to_string(), "/unused/b".to_string()],
        "unused pointers must be sorted deterministically"
    );
}
