//! fleet-reconcile — keeps tracked optimizer workers honest.
//!
//! The reconciler polls the resource container for every tracked resource,
//! debounces the observations, reclaims workers that stay dead, and asks
//! the scheduler for replacements.
//!
//! # Architecture
//!
//! ```text
//! Reconciler
//!   ├── tracked: resource_id → (Resource, StatusTracker)
//!   ├── targets: group → desired live workers
//!   ├── reconcile_once()
//!   │   ├── ResourceContainer::get_status() for every tracked id, concurrently
//!   │   ├── StatusTracker::record() → Liveness
//!   │   ├── Dead → ResourceContainer::release_resource() → untrack
//!   │   └── ReplacementCallback(ReplacementRequest) per group that lost workers
//!   └── run(shutdown) — reconcile_once() every poll interval
//! ```
//!
//! # Debouncing
//!
//! `Unknown` means "not yet confirmed dead". It only counts against a
//! resource that has been seen `Running` before; a backend that cannot
//! report status therefore never triggers reclamation.

pub mod error;
pub mod reconciler;
pub mod tracker;

pub use error::{ReconcileError, ReconcileResult};
pub use reconciler::{
    ReconcileReport, Reconciler, ReconcilerConfig, ReplacementCallback, ReplacementRequest,
};
pub use tracker::{Liveness, StatusTracker};
