//! Latency Sensor (C6): rolling P95/P99 tracker over signal-processing
//! latency, with a spike count that engages the circuit breaker.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::circuit_breaker::CircuitBreaker;

const DEFAULT_WINDOW: usize = 100;
const DEFAULT_CRITICAL_MS: f64 = 100.0;
const DEFAULT_WARNING_MS: f64 = 50.0;
const SPIKE_ENGAGE_THRESHOLD: u32 = 3;

pub struct LatencySensorConfig {
    pub window: usize,
    pub critical_ms: f64,
    pub warning_ms: f64,
}

impl Default for LatencySensorConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            critical_ms: DEFAULT_CRITICAL_MS,
            warning_ms: DEFAULT_WARNING_MS,
        }
    }
}

struct State {
    samples: VecDeque<f64>,
    spike_count: u32,
}

pub struct LatencySensor {
    config: LatencySensorConfig,
    state: Mutex<State>,
    breaker: Arc<CircuitBreaker>,
}

impl LatencySensor {
    pub fn new(config: LatencySensorConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                samples: VecDeque::with_capacity(DEFAULT_WINDOW),
                spike_count: 0,
            }),
            breaker,
        }
    }

    /// Records the processing latency, in milliseconds, for one signal.
    pub fn observe(&self, latency_ms: f64) {
        let mut state = self.state.lock();
        if state.samples.len() == self.config.window {
            state.samples.pop_front();
        }
        state.samples.push_back(latency_ms);

        if latency_ms > self.config.critical_ms {
            state.spike_count += 1;
            if state.spike_count >= SPIKE_ENGAGE_THRESHOLD {
                error!(
                    spike_count = state.spike_count,
                    latency_ms, "repeated latency spikes, engaging circuit breaker"
                );
                self.breaker.engage(
                    "LATENCY_SPIKE",
                    serde_json::json!({"spike_count": state.spike_count, "latest_ms": latency_ms}),
                );
            }
        } else if latency_ms > self.config.warning_ms {
            tracing::warn!(latency_ms, "latency warning threshold crossed");
        }
    }

    pub fn p95(&self) -> f64 {
        percentile(&self.state.lock().samples, 95.0)
    }

    pub fn p99(&self) -> f64 {
        percentile(&self.state.lock().samples, 99.0)
    }

    pub fn spike_count(&self) -> u32 {
        self.state.lock().spike_count
    }
}

/// Exact percentile over the window: nearest-rank on a sorted copy of the
/// samples.
fn percentile(samples: &VecDeque<f64>, p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor() -> (LatencySensor, Arc<CircuitBreaker>) {
        let dir = tempfile::tempdir().unwrap();
        let breaker = Arc::new(CircuitBreaker::new(dir.path().join("halt.lock")));
        (
            LatencySensor::new(LatencySensorConfig::default(), breaker.clone()),
            breaker,
        )
    }

    #[test]
    fn tracks_percentiles_over_the_window() {
        let (sensor, _breaker) = sensor();
        for ms in 1..=100 {
            sensor.observe(ms as f64);
        }
        assert_eq!(sensor.p95(), 95.0);
        assert_eq!(sensor.p99(), 99.0);
    }

    #[test]
    fn three_critical_spikes_engage_the_breaker() {
        let (sensor, breaker) = sensor();
        sensor.observe(10.0);
        sensor.observe(150.0);
        assert!(!breaker.should_halt());
        sensor.observe(150.0);
        assert!(!breaker.should_halt());
        sensor.observe(150.0);
        assert!(breaker.should_halt());
    }

    #[test]
    fn warning_band_alone_does_not_engage() {
        let (sensor, breaker) = sensor();
        for _ in 0..10 {
            sensor.observe(60.0);
        }
        assert!(!breaker.should_halt());
    }
}
