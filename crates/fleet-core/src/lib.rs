//! fleet-core — shared types for the optimizer fleet manager.
//!
//! Holds the `Resource` record the scheduler owns, the `StartupFacts` a
//! backend reports after scale-out, the immutable `ContainerProperties`
//! handed to every container, and the `fleetd` configuration file format.

pub mod config;
pub mod properties;
pub mod types;

pub use config::{ContainerSection, FleetConfig, GroupSection, ReconcilerSection, parse_duration};
pub use properties::{ContainerProperties, PropertyError, keys, property_as_bool};
pub use types::*;
