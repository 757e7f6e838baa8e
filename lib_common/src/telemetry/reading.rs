//! # Sensor Reading
//!
//! One synthetic sample produced by the generator. A `Reading` is immutable once
//! built: it is persisted, replayed to new subscribers and fanned out to live ones
//! exactly as it was created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Generation counter, strictly increasing across the process lifetime and
    /// resumed from storage on restart. Not part of the wire format.
    #[serde(skip)]
    pub seq: u64,
    /// When the sample was taken (UTC, microsecond precision).
    pub timestamp: DateTime<Utc>,
    /// Simulated speed in km/h, copied from the control parameter.
    pub speed: f64,
    /// Temperature in °C.
    pub temperature: f64,
    /// Pressure in Pa.
    pub pressure: f64,
}
