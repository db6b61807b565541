//! Environment propagation from `export.`-prefixed container properties.

use fleet_core::{ContainerProperties, keys};

use crate::error::{ContainerError, ContainerResult};

/// Reject `export.` keys without a variable name. Checked at container init.
pub fn validate_exports(properties: &ContainerProperties) -> ContainerResult<()> {
    if properties
        .with_prefix(keys::EXPORT_PROPERTY_PREFIX)
        .any(|(name, _)| name.trim().is_empty())
    {
        return Err(ContainerError::Configuration(format!(
            "{} property without a variable name",
            keys::EXPORT_PROPERTY_PREFIX
        )));
    }
    Ok(())
}

/// Variables exported to workers, as `(NAME, value)` pairs in configuration order.
pub fn exported_variables(properties: &ContainerProperties) -> Vec<(String, String)> {
    properties
        .with_prefix(keys::EXPORT_PROPERTY_PREFIX)
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Shell statements (`export NAME=value`), one per exported variable.
///
/// Ordering is for display only; nothing should depend on it.
pub fn export_statements(properties: &ContainerProperties) -> Vec<String> {
    exported_variables(properties)
        .into_iter()
        .map(|(name, value)| format!("export {name}={value}"))
        .collect()
}
