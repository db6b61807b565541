//! Domain types for optimizer resources.
//!
//! A `Resource` is the scheduler's record of one worker slot. Scale-out
//! never mutates it: the backend reports `StartupFacts`, and the caller
//! folds them in with [`Resource::merged_with`].

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a resource (worker slot).
pub type ResourceId = String;

/// Lifecycle of a resource as tracked by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Requested,
    Running,
    Dead,
    Released,
}

impl ResourceStatus {
    /// Whether the slot still counts towards its group's parallelism.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Requested | Self::Running)
    }
}

/// A backend's view of a resource at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedStatus {
    Running,
    Dead,
    /// No status available: unknown id, unsupported query, or a transient failure.
    Unknown,
}

impl std::fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One requested or running optimizer worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Empty until assigned by the container or a backend.
    #[serde(default)]
    pub resource_id: ResourceId,
    /// Optimizing group this slot serves.
    pub group_name: String,
    /// Requested worker parallelism.
    pub thread_count: u32,
    /// Input configuration, plus backend facts once merged.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    pub fn new(group_name: impl Into<String>, thread_count: u32) -> Self {
        Self {
            resource_id: String::new(),
            group_name: group_name.into(),
            thread_count,
            properties: HashMap::new(),
            status: ResourceStatus::Requested,
        }
    }

    pub fn with_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn has_id(&self) -> bool {
        !self.resource_id.is_empty()
    }

    /// Fold startup facts into this resource.
    ///
    /// Caller keys are kept; keys the backend reports overwrite them. A
    /// backend-assigned id is adopted only when this resource has none.
    pub fn apply_facts(&mut self, facts: &StartupFacts) {
        if !self.has_id()
            && let Some(id) = facts.resource_id.as_deref().filter(|id| !id.is_empty())
        {
            self.resource_id = id.to_string();
        }
        self.properties.extend(
            facts
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    /// Copy of this resource with `facts` applied.
    pub fn merged_with(&self, facts: &StartupFacts) -> Resource {
        let mut merged = self.clone();
        merged.apply_facts(facts);
        merged
    }
}

/// What a backend observed while creating a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupFacts {
    /// Identity assigned by the container or pre-allocated by the backend.
    pub resource_id: Option<ResourceId>,
    /// Backend-owned properties (pid, pod name, job id, launch time...).
    pub properties: BTreeMap<String, String>,
}

impl StartupFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
