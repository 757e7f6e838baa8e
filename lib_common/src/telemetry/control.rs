//! # Control Parameter
//!
//! The shared, bounded "speed" scalar. The generator reads it on every tick and
//! subscribers nudge it with `speedDelta` messages. The value lives behind a
//! read-many/write-one lock and is clamped inside the write guard, so no reader
//! can ever observe it outside its bounds.

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// Inclusive bounds and start value of the control parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlBounds {
    /// Lowest value the parameter may take.
    pub min: f64,
    /// Highest value the parameter may take.
    pub max: f64,
    /// Value at process start.
    pub initial: f64,
}

impl Default for ControlBounds {
    fn default() -> Self {
        Self {
            min: 75.0,
            max: 125.0,
            initial: 100.0,
        }
    }
}

/// The shared speed setting.
#[derive(Debug)]
pub struct ControlParameter {
    value: RwLock<f64>,
    bounds: ControlBounds,
}

impl ControlParameter {
    /// Creates the parameter at `bounds.initial`, clamped into `[min, max]`.
    pub fn new(bounds: ControlBounds) -> Self {
        Self {
            value: RwLock::new(bounds.initial.clamp(bounds.min, bounds.max)),
            bounds,
        }
    }

    /// Current value.
    pub fn read(&self) -> f64 {
        *self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `delta` and clamps the result before the write guard is released.
    ///
    /// Returns the value after the update. A non-finite delta leaves the value
    /// untouched.
    pub fn apply_delta(&self, delta: f64) -> f64 {
        let mut guard = self.value.write().unwrap_or_else(PoisonError::into_inner);
        if !delta.is_finite() {
            log::warn!("Ignoring non-finite speed delta {}", delta);
            return *guard;
        }
        *guard = (*guard + delta).clamp(self.bounds.min, self.bounds.max);
        log::info!("Speed adjusted by {:.0}, new base speed = {:.2}", delta, *guard);
        *guard
    }

    /// Bounds this parameter was created with.
    pub fn bounds(&self) -> ControlBounds {
        self.bounds
    }
}

impl Default for ControlParameter {
    fn default() -> Self {
        Self::new(ControlBounds::default())
    }
}
