//! Unused-key detection: flags YAML keys nothing in the running process
//! actually reads, which is how a typo'd config key silently does nothing.
//!
//! A `ConfigMode` declares which JSON-pointer subtrees a deployment profile
//! consumes; anything outside that set is reported, and under
//! [`UnusedKeyPolicy::Fail`] treated as a startup error.

use anyhow::{bail, Result};
use serde_json::Value;

/// Which components of the runtime a process hosts — determines which
/// config subtrees are expected to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    /// Runs the coordination procedure plus both workers (the daemon).
    Coordinator,
    /// Runs only the publisher worker loop.
    PublisherOnly,
    /// Runs only the perspective worker loop.
    PerspectiveOnly,
}

pub fn consumed_pointers(mode: ConfigMode) -> &'static [&'static str] {
    match mode {
        ConfigMode::Coordinator => COORDINATOR,
        ConfigMode::PublisherOnly => PUBLISHER_ONLY,
        ConfigMode::PerspectiveOnly => PERSPECTIVE_ONLY,
    }
}

static COORDINATOR: &[&str] = &["/scheduler", "/database", "/publisher", "/perspective"];
static PUBLISHER_ONLY: &[&str] = &["/scheduler", "/database", "/publisher"];
static PERSPECTIVE_ONLY: &[&str] = &["/scheduler", "/database", "/perspective"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct UnusedKeyReport {
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Walks every leaf in `config_json`, reports pointers not covered by any of
/// `mode`'s consumed subtrees. Under `Fail`, returns `Err` if any are found.
pub fn report_unused_keys(
    mode: ConfigMode,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed = consumed_pointers(mode);
    let mut unused = Vec::new();
    collect_unused_leaves(config_json, String::new(), consumed, &mut unused);
    unused.sort();

    if policy == UnusedKeyPolicy::Fail && !unused.is_empty() {
        bail!("CONFIG_UNUSED_KEYS: {} unused config key(s): {:?}", unused.len(), unused);
    }

    Ok(UnusedKeyReport { unused_leaf_pointers: unused })
}

fn collect_unused_leaves(v: &Value, prefix: String, consumed: &[&str], out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                let pointer = format!("{prefix}/{k}");
                collect_unused_leaves(child, pointer, consumed, out);
            }
        }
        _ => {
            if !is_consumed(&prefix, consumed) {
                out.push(prefix);
            }
        }
    }
}

/// A pointer is consumed if it exactly matches a registered entry or falls
/// under one as a subtree (registered entry is a strict path prefix).
fn is_consumed(pointer: &str, consumed: &[&str]) -> bool {
    consumed.iter().any(|c| pointer == *c || pointer.starts_with(&format!("{c}/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_keys_under_a_consumed_subtree_are_consumed() {
        assert!(is_consumed("/scheduler/lease_seconds", consumed_pointers(ConfigMode::Coordinator)));
        assert!(is_consumed("/scheduler", consumed_pointers(ConfigMode::Coordinator)));
    }

    #[test]
    fn unrelated_prefix_is_not_consumed_by_partial_string_match() {
        // "/scheduler_extra" must not be treated as under "/scheduler".
        assert!(!is_consumed("/scheduler_extra/foo", consumed_pointers(ConfigMode::Coordinator)));
    }
}
