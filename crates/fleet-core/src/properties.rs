//! Property keys and the immutable container configuration map.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known property keys shared by the container and its backends.
pub mod keys {
    /// Installation directory of the management service.
    pub const AMS_HOME: &str = "ams.home";
    /// Optimizing-service address: container-wide default, or a per-resource override.
    pub const AMS_OPTIMIZER_URI: &str = "ams.optimizing.uri";
    /// Worker heartbeat interval in milliseconds.
    pub const OPTIMIZER_HEART_BEAT_INTERVAL: &str = "optimizer.heart-beat-interval";
    pub const OPTIMIZER_EXTEND_DISK_STORAGE: &str = "optimizer.extend-disk-storage";
    pub const OPTIMIZER_EXTEND_DISK_STORAGE_DEFAULT: bool = false;
    pub const OPTIMIZER_DISK_STORAGE_PATH: &str = "optimizer.disk-storage-path";
    pub const OPTIMIZER_MEMORY_STORAGE_SIZE: &str = "optimizer.memory-storage-size";
    /// Configuration keys with this prefix are exported into the worker environment.
    pub const EXPORT_PROPERTY_PREFIX: &str = "export.";
    /// Launch timestamp (epoch millis), reported by every backend.
    pub const STARTED_AT: &str = "started-at";
}

/// Errors raised while reading configuration properties.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("missing required property: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Container-wide configuration.
///
/// Supplied once when a container is initialized and never mutated
/// afterwards. Backed by an ordered map so iteration (and therefore the
/// exported environment) is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerProperties(BTreeMap<String, String>);

impl ContainerProperties {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value for `key`, treating an empty string as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    /// Non-empty value for `key`, or `PropertyError::Missing`.
    pub fn require(&self, key: &str) -> Result<&str, PropertyError> {
        self.get_non_empty(key)
            .ok_or_else(|| PropertyError::Missing(key.to_string()))
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_non_empty(key).unwrap_or(default)
    }

    /// Parse `key` as an unsigned integer, falling back to `default` when absent.
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, PropertyError> {
        match self.get_non_empty(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| PropertyError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries whose key starts with `prefix`, with the prefix stripped.
    pub fn with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|name| (name, v)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ContainerProperties {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ContainerProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Read a boolean property. Only `true` (any case) counts as true; a
/// missing key yields `default`.
pub fn property_as_bool(props: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match props.get(key) {
        Some(v) => v.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> ContainerProperties {
        ContainerProperties::from_iter([
            (keys::AMS_HOME, "/opt/ams"),
            (keys::AMS_OPTIMIZER_URI, "thrift://h:1260"),
            ("export.JAVA_HOME", "/usr/lib/jvm"),
            ("export.HADOOP_USER_NAME", "arctic"),
            ("local.scale-out-timeout", ""),
            ("local.max-workers", "x"),
        ])
    }

    #[test]
    fn require_rejects_missing_and_empty() {
        let p = props();
        assert_eq!(p.require(keys::AMS_HOME), Ok("/opt/ams"));
        assert_eq!(
            p.require("local.scale-out-timeout"),
            Err(PropertyError::Missing("local.scale-out-timeout".into()))
        );
        assert!(p.require("nope").is_err());
    }

    #[test]
    fn prefix_iteration_strips_prefix_in_key_order() {
        let p = props();
        let exported: Vec<_> = p.with_prefix(keys::EXPORT_PROPERTY_PREFIX).collect();
        assert_eq!(
            exported,
            vec![("HADOOP_USER_NAME", "arctic"), ("JAVA_HOME", "/usr/lib/jvm")]
        );
    }

    #[test]
    fn get_u64_defaults_and_rejects_garbage() {
        let p = props();
        assert_eq!(p.get_u64("absent", 7), Ok(7));
        assert!(matches!(
            p.get_u64("local.max-workers", 1),
            Err(PropertyError::Invalid { .. })
        ));
    }

    #[test]
    fn bool_property_semantics() {
        let mut m = HashMap::new();
        assert!(!property_as_bool(&m, "k", false));
        assert!(property_as_bool(&m, "k", true));
        m.insert("k".to_string(), "TRUE".to_string());
        assert!(property_as_bool(&m, "k", false));
        m.insert("k".to_string(), "yes".to_string());
        assert!(!property_as_bool(&m, "k", true));
    }

    #[test]
    fn deserializes_from_toml_table() {
        let p: ContainerProperties = toml::from_str(
            r#"
"ams.home" = "/opt/ams"
"export.A" = "1"
"#,
        )
        .unwrap();
        assert_eq!(p.get(keys::AMS_HOME), Some("/opt/ams"));
        assert_eq!(p.len(), 2);
    }
}
