//! # Engine Configuration
//!
//! Tunables of the telemetry engine. Every value has a default matching the
//! stock deployment: one reading per second, retention trim every 100 seconds
//! down to the 10 newest rows, 10 readings served and replayed, and a hand-off
//! buffer of 200 readings between generator and fanout.

use super::control::ControlBounds;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rejected engine configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("control bounds are inconsistent: min {min}, initial {initial}, max {max}")]
    Bounds { min: f64, initial: f64, max: f64 },
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Milliseconds between two generated readings.
    pub generation_period_ms: u64,
    /// Milliseconds between two retention trims.
    pub trim_period_ms: u64,
    /// Rows kept by each trim.
    pub retention: usize,
    /// Readings returned by the history endpoint.
    pub history_len: usize,
    /// Readings replayed to a newly attached subscriber.
    pub replay_len: usize,
    /// Capacity of the generator -> fanout hand-off buffer.
    pub fanout_capacity: usize,
    /// Bounds of the shared speed setting.
    pub control: ControlBounds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_period_ms: 1_000,
            trim_period_ms: 100_000,
            retention: 10,
            history_len: 10,
            replay_len: 10,
            fanout_capacity: 200,
            control: ControlBounds::default(),
        }
    }
}

impl EngineConfig {
    pub fn generation_period(&self) -> Duration {
        Duration::from_millis(self.generation_period_ms)
    }

    pub fn trim_period(&self) -> Duration {
        Duration::from_millis(self.trim_period_ms)
    }

    /// Checks the settings before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_period_ms == 0 {
            return Err(ConfigError::Zero("generationPeriodMs"));
        }
        if self.trim_period_ms == 0 {
            return Err(ConfigError::Zero("trimPeriodMs"));
        }
        if self.retention == 0 {
            return Err(ConfigError::Zero("retention"));
        }
        if self.fanout_capacity == 0 {
            return Err(ConfigError::Zero("fanoutCapacity"));
        }

        let ControlBounds { min, max, initial } = self.control;
        let finite = min.is_finite() && max.is_finite() && initial.is_finite();
        if !finite || min > max || initial < min || initial > max {
            return Err(ConfigError::Bounds { min, initial, max });
        }
        Ok(())
    }
}
