// Declare the modules to re-export
#[cfg(feature = "telemetry")]
pub mod telemetry;
