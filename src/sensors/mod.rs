//! Runtime Guardian sensors: latency (C6) and signal drift (C7).

pub mod drift;
pub mod latency;

pub use drift::DriftSensor;
pub use latency::{LatencySensor, LatencySensorConfig};
