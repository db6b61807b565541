//! Per-resource debouncing of status observations.

use tracing::{debug, warn};

use fleet_core::ObservedStatus;

/// What the reconciler should make of a resource after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Confirmed running.
    Alive,
    /// Never seen running and no evidence against it yet.
    Pending,
    /// Consecutive non-running observations below the threshold.
    Suspect(u32),
    /// Threshold reached; the resource should be reclaimed.
    Dead,
}

/// Tracks consecutive non-running observations for a single resource.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    /// Consecutive observations counted against the resource.
    consecutive_misses: u32,
    /// Misses needed before declaring the resource dead.
    dead_threshold: u32,
    /// Whether the resource has ever been observed running.
    seen_running: bool,
    last: Liveness,
}

impl StatusTracker {
    /// A zero threshold is treated as 1.
    pub fn new(dead_threshold: u32) -> Self {
        Self {
            consecutive_misses: 0,
            dead_threshold: dead_threshold.max(1),
            seen_running: false,
            last: Liveness::Pending,
        }
    }

    /// Record one observation and return the resulting liveness.
    pub fn record(&mut self, observed: ObservedStatus) -> Liveness {
        match observed {
            ObservedStatus::Running => {
                if self.consecutive_misses > 0 {
                    debug!(misses = self.consecutive_misses, "resource running again");
                }
                self.consecutive_misses = 0;
                self.seen_running = true;
            }
            ObservedStatus::Dead => self.consecutive_misses += 1,
            // Unconfirmed: counts only once the resource is known to have run.
            ObservedStatus::Unknown if self.seen_running => self.consecutive_misses += 1,
            ObservedStatus::Unknown => {}
        }

        self.last = if self.consecutive_misses >= self.dead_threshold {
            if self.last != Liveness::Dead {
                warn!(
                    misses = self.consecutive_misses,
                    threshold = self.dead_threshold,
                    "resource declared dead"
                );
            }
            Liveness::Dead
        } else if self.consecutive_misses > 0 {
            Liveness::Suspect(self.consecutive_misses)
        } else if self.seen_running {
            Liveness::Alive
        } else {
            Liveness::Pending
        };
        self.last
    }

    pub fn liveness(&self) -> Liveness {
        self.last
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn seen_running(&self) -> bool {
        self.seen_running
    }
}
