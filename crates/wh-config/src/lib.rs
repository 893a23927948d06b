use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod consumption;

pub use consumption::{report_unused_keys, ConfigMode, UnusedKeyPolicy, UnusedKeyReport};

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut contents = Vec::with_capacity(paths.len());
    for p in paths {
        contents.push(fs::read_to_string(p).with_context(|| format!("read config: {p}"))?);
    }
    load_layered_yaml_from_strings(&contents.iter().map(String::as_str).collect::<Vec<_>>())
}

/// Same as [`load_layered_yaml`] but takes YAML source directly, for
/// composing layers that don't live on disk (tests, embedded defaults).
pub fn load_layered_yaml_from_strings(sources: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for s in sources {
        let yaml_val: serde_yaml::Value = serde_yaml::from_str(s).context("parse yaml layer")?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// §6 configuration knobs: partition count, lease/stale thresholds, polling
/// cadence, idle detection, and the two feature toggles. Values are the
/// spec's defaults; any YAML layer or env override replaces them before
/// `from_config_json` is called.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub partition_count: i32,
    pub lease_seconds: i64,
    pub stale_threshold_seconds: i64,
    pub polling_interval_ms: u64,
    pub idle_threshold_polls: u32,
    pub parallelize_streams: bool,
    pub debug_mode: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            partition_count: 10_000,
            lease_seconds: 300,
            stale_threshold_seconds: 600,
            polling_interval_ms: 250,
            idle_threshold_polls: 2,
            parallelize_streams: false,
            debug_mode: false,
        }
    }
}

impl SchedulerConfig {
    /// Reads `/scheduler` out of a merged config document, falling back to
    /// defaults for any key that section omits.
    pub fn from_config_json(config_json: &Value) -> Result<Self> {
        let Some(section) = config_json.pointer("/scheduler") else {
            return Ok(Self::default());
        };
        serde_json::from_value(section.clone()).context("invalid /scheduler section")
    }

    /// Applies `WH_`-prefixed environment overrides on top of a parsed
    /// config, mirroring `wh_db::connect_from_env`'s env-first posture for
    /// operational knobs that are commonly flipped per-deployment.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var("WH_LEASE_SECONDS") {
            self.lease_seconds = v.parse().context("WH_LEASE_SECONDS must be an integer")?;
        }
        if let Ok(v) = std::env::var("WH_STALE_THRESHOLD_SECONDS") {
            self.stale_threshold_seconds = v
                .parse()
                .context("WH_STALE_THRESHOLD_SECONDS must be an integer")?;
        }
        if let Ok(v) = std::env::var("WH_POLLING_INTERVAL_MS") {
            self.polling_interval_ms = v.parse().context("WH_POLLING_INTERVAL_MS must be an integer")?;
        }
        if let Ok(v) = std::env::var("WH_DEBUG_MODE") {
            self.debug_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_count <= 0 {
            bail!("partition_count must be positive");
        }
        if self.lease_seconds <= 0 {
            bail!("lease_seconds must be positive");
        }
        if self.stale_threshold_seconds <= self.lease_seconds {
            bail!("stale_threshold_seconds must exceed lease_seconds");
        }
        if !(100..=1000).contains(&self.polling_interval_ms) {
            bail!("polling_interval_ms must be within 100..=1000");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_knobs() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.partition_count, 10_000);
        assert_eq!(cfg.lease_seconds, 300);
        assert_eq!(cfg.stale_threshold_seconds, 600);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn from_config_json_falls_back_to_defaults_when_section_absent() {
        let cfg = SchedulerConfig::from_config_json(&serde_json::json!({})).unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
    }

    #[test]
    fn from_config_json_overrides_named_fields_only() {
        let doc = serde_json::json!({
            "scheduler": { "lease_seconds": 45, "debug_mode": true }
        });
        let cfg = SchedulerConfig::from_config_json(&doc).unwrap();
        assert_eq!(cfg.lease_seconds, 45);
        assert!(cfg.debug_mode);
        assert_eq!(cfg.partition_count, 10_000); // untouched field keeps default
    }

    #[test]
    fn validate_rejects_stale_threshold_below_lease() {
        let mut cfg = SchedulerConfig::default();
        cfg.stale_threshold_seconds = cfg.lease_seconds;
        assert!(cfg.validate().is_err());
    }
}
