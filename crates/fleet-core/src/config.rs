//! fleet.toml configuration parser.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::properties::ContainerProperties;
use crate::types::Resource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub container: ContainerSection,
    #[serde(default)]
    pub reconciler: ReconcilerSection,
    #[serde(default)]
    pub groups: Vec<GroupSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    pub name: String,
    /// Registry name of the backend: "local", "kubernetes", "external-job", "memory".
    pub backend: String,
    #[serde(default)]
    pub properties: ContainerProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_dead_threshold")]
    pub dead_threshold: u32,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            dead_threshold: default_dead_threshold(),
        }
    }
}

impl ReconcilerSection {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(10))
    }
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

fn default_dead_threshold() -> u32 {
    3
}

/// Static parallelism for one optimizing group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSection {
    pub name: String,
    /// Number of worker slots to keep alive.
    pub parallelism: u32,
    /// Threads per worker slot.
    pub thread_count: u32,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl GroupSection {
    /// A fresh resource request for one slot of this group.
    pub fn resource(&self) -> Resource {
        Resource {
            properties: self.properties.clone(),
            ..Resource::new(&self.name, self.thread_count)
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn group(&self, name: &str) -> Option<&GroupSection> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
