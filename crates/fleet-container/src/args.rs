//! Worker command line construction.
//!
//! The optimizer worker parses a fixed flag order:
//!
//! ```text
//! -a <endpoint> -p <threads> -g <group> [-hb <ms>] [-eds -dsp <path> [-msz <size>]] [-id <resource id>]
//! ```

use std::fmt;

use fleet_core::{Resource, keys, property_as_bool};

use crate::error::{ContainerError, ContainerResult};

/// Startup arguments for one worker, in flag order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupArgs(Vec<String>);

impl StartupArgs {
    /// Arguments as an argv vector (no shell quoting needed).
    pub fn argv(&self) -> &[String] {
        &self.0
    }

    pub fn into_argv(self) -> Vec<String> {
        self.0
    }

    fn flag(&mut self, flag: &str, value: impl Into<String>) {
        self.0.push(flag.to_string());
        self.0.push(value.into());
    }
}

impl fmt::Display for StartupArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// The endpoint a worker should report to: the resource override when it
/// is set and non-empty, otherwise the container default.
pub fn optimizing_uri<'a>(default_uri: &'a str, resource: &'a Resource) -> &'a str {
    resource
        .property(keys::AMS_OPTIMIZER_URI)
        .filter(|uri| !uri.trim().is_empty())
        .unwrap_or(default_uri)
}

/// Reject malformed requests before any backend is touched.
pub fn validate_resource(resource: &Resource) -> ContainerResult<()> {
    if resource.group_name.trim().is_empty() {
        return Err(ContainerError::Validation(
            "optimizing group name is empty".to_string(),
        ));
    }
    if resource.thread_count == 0 {
        return Err(ContainerError::Validation(format!(
            "thread count must be positive for group {}",
            resource.group_name
        )));
    }
    if extended_disk_storage(resource) {
        disk_storage_path(resource)?;
    }
    Ok(())
}

/// Build the worker command line for `resource`.
///
/// Pure: reads the resource, never mutates it. Fails only when extended
/// disk storage is enabled without a storage path.
pub fn build_startup_arguments(
    default_uri: &str,
    resource: &Resource,
) -> ContainerResult<StartupArgs> {
    let mut args = StartupArgs(Vec::with_capacity(14));
    args.flag("-a", optimizing_uri(default_uri, resource));
    args.flag("-p", resource.thread_count.to_string());
    args.flag("-g", resource.group_name.as_str());

    // Passed whenever the key is present, even empty.
    if let Some(interval) = resource.property(keys::OPTIMIZER_HEART_BEAT_INTERVAL) {
        args.flag("-hb", interval);
    }

    if extended_disk_storage(resource) {
        args.0.push("-eds".to_string());
        args.flag("-dsp", disk_storage_path(resource)?);
        if let Some(size) = non_empty(resource, keys::OPTIMIZER_MEMORY_STORAGE_SIZE) {
            args.flag("-msz", size);
        }
    }

    if resource.has_id() {
        args.flag("-id", resource.resource_id.as_str());
    }

    Ok(args)
}

fn extended_disk_storage(resource: &Resource) -> bool {
    property_as_bool(
        &resource.properties,
        keys::OPTIMIZER_EXTEND_DISK_STORAGE,
        keys::OPTIMIZER_EXTEND_DISK_STORAGE_DEFAULT,
    )
}

fn disk_storage_path(resource: &Resource) -> ContainerResult<&str> {
    non_empty(resource, keys::OPTIMIZER_DISK_STORAGE_PATH).ok_or_else(|| {
        ContainerError::Validation(format!(
            "{} is required when {} is enabled",
            keys::OPTIMIZER_DISK_STORAGE_PATH,
            keys::OPTIMIZER_EXTEND_DISK_STORAGE
        ))
    })
}

fn non_empty<'a>(resource: &'a Resource, key: &str) -> Option<&'a str> {
    resource.property(key).filter(|v| !v.trim().is_empty())
}
