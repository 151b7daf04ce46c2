//! Drift Sensor (C7): population stability index over the signal stream,
//! comparing a reference window (the session's first N signals) against the
//! current rolling window.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreaker;

const DEFAULT_WINDOW: usize = 500;
const PSI_THRESHOLD: f64 = 0.25;
const DRIFT_EVENTS_ENGAGE_THRESHOLD: usize = 5;
const DRIFT_EVENT_LOOKBACK: ChronoDuration = ChronoDuration::hours(24);
/// Additive smoothing so that ln(p/q) is always defined even for empty buckets.
const PSI_SMOOTHING: f64 = 1e-4;

struct State {
    reference: Vec<i8>,
    current: VecDeque<i8>,
    drift_events: VecDeque<DateTime<Utc>>,
}

pub struct DriftSensor {
    window: usize,
    state: Mutex<State>,
    breaker: Arc<CircuitBreaker>,
}

impl DriftSensor {
    pub fn new(window: usize, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            window,
            state: Mutex::new(State {
                reference: Vec::with_capacity(window),
                current: VecDeque::with_capacity(window),
                drift_events: VecDeque::new(),
            }),
            breaker,
        }
    }

    pub fn default_with_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self::new(DEFAULT_WINDOW, breaker)
    }

    /// Observes one emitted signal (in {-1, 0, +1}). The first `window`
    /// signals of the session become the reference distribution; subsequent
    /// signals roll through the current window.
    pub fn observe(&self, signal: i8, at: DateTime<Utc>) -> Option<f64> {
        let mut state = self.state.lock();
        if state.reference.len() < self.window {
            state.reference.push(signal);
            return None;
        }

        if state.current.len() == self.window {
            state.current.pop_front();
        }
        state.current.push_back(signal);
        if state.current.len() < self.window {
            return None;
        }

        let psi = population_stability_index(&state.reference, state.current.make_contiguous());
        if psi >= PSI_THRESHOLD {
            warn!(psi, "drift event: PSI crossed threshold");
            state.drift_events.push_back(at);
            let cutoff = at - DRIFT_EVENT_LOOKBACK;
            while state
                .drift_events
                .front()
                .map(|t| *t < cutoff)
                .unwrap_or(false)
            {
                state.drift_events.pop_front();
            }
            let count = state.drift_events.len();
            if count > DRIFT_EVENTS_ENGAGE_THRESHOLD {
                error!(count, "repeated drift events within 24h, engaging circuit breaker");
                self.breaker.engage(
                    "SIGNAL_DRIFT",
                    serde_json::json!({"drift_events_24h": count, "psi": psi}),
                );
            }
            Some(psi)
        } else {
            None
        }
    }

    pub fn drift_events_24h(&self) -> usize {
        self.state.lock().drift_events.len()
    }
}

fn bucket_proportions(signals: &[i8]) -> [f64; 3] {
    let mut counts = [0u64; 3];
    for &s in signals {
        let idx = match s {
            -1 => 0,
            0 => 1,
            1 => 2,
            _ => continue,
        };
        counts[idx] += 1;
    }
    let total = signals.len().max(1) as f64;
    [
        counts[0] as f64 / total,
        counts[1] as f64 / total,
        counts[2] as f64 / total,
    ]
}

/// PSI = sum over buckets of (p_i - q_i) * ln(p_i / q_i), with additive
/// smoothing so the logarithm is always defined.
pub fn population_stability_index(reference: &[i8], current: &[i8]) -> f64 {
    let p = bucket_proportions(current);
    let q = bucket_proportions(reference);
    p.iter()
        .zip(q.iter())
        .map(|(&pi, &qi)| {
            let pi = pi + PSI_SMOOTHING;
            let qi = qi + PSI_SMOOTHING;
            (pi - qi) * (pi / qi).ln()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(window: usize) -> (DriftSensor, Arc<CircuitBreaker>) {
        let dir = tempfile::tempdir().unwrap();
        let breaker = Arc::new(CircuitBreaker::new(dir.path().join("halt.lock")));
        (DriftSensor::new(window, breaker.clone()), breaker)
    }

    #[test]
    fn identical_distributions_have_zero_psi() {
        let signals = vec![1i8, 0, -1, 1, 0, -1, 1, 0, -1, 1];
        let psi = population_stability_index(&signals, &signals);
        assert!(psi.abs() < 1e-6);
    }

    #[test]
    fn no_drift_event_until_window_fills() {
        let (sensor, _b) = sensor(5);
        for _ in 0..4 {
            assert!(sensor.observe(1, Utc::now()).is_none());
        }
    }

    #[test]
    fn regime_change_raises_a_drift_event() {
        let (sensor, _b) = sensor(5);
        for _ in 0..5 {
            sensor.observe(1, Utc::now());
        }
        let mut last = None;
        for _ in 0..5 {
            last = sensor.observe(-1, Utc::now());
        }
        assert!(last.unwrap() >= PSI_THRESHOLD);
    }

    #[test]
    fn more_than_five_events_in_24h_engage_breaker() {
        let (sensor, breaker) = sensor(3);
        for _ in 0..3 {
            sensor.observe(1, Utc::now());
        }
        let now = Utc::now();
        for i in 0..6 {
            for _ in 0..3 {
                sensor.observe(-1, now + ChronoDuration::minutes(i));
            }
            for _ in 0..3 {
                sensor.observe(1, now + ChronoDuration::minutes(i));
            }
        }
        assert!(breaker.should_halt());
    }
}
