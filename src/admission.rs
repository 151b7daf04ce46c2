//! Admission Engine (C13): consumes shadow records and a model-comparison
//! report and emits a GO / NO-GO / WARNING decision plus a deterministic
//! hash that authorizes the launcher to start live trading.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::sensors::drift::population_stability_index;
use crate::shadow_recorder::SignalRecord;

const CRITICAL_LATENCY_MS: f64 = 100.0;
const DRIFT_WINDOW: usize = 500;
const PSI_THRESHOLD: f64 = 0.25;
const DEFAULT_SLIPPAGE_PIPS: f64 = 1.0;
const PIP: f64 = 0.0001;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub baseline_f1: f64,
    pub challenger_f1: f64,
    pub diversity_index: f64,
    pub consistency_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Go,
    Warning,
    NoGo,
}

/// Metrics derived from the shadow record set, serialized in this fixed
/// field order so that the decision hash is reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub critical_errors: u64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub drift_events_24h: u64,
    pub challenger_f1: f64,
    pub diversity_index: f64,
    pub pnl_net_return: f64,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub timestamp: DateTime<Utc>,
    pub decision: Decision,
    pub approval_confidence: f64,
    pub critical_errors: u64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub drift_events_24h: u64,
    pub pnl_net_return: f64,
    pub diversity_index: f64,
    pub rejection_reasons: Vec<String>,
    pub decision_hash: String,
    pub position_coefficient: f64,
}

/// Builder for `AdmissionDecision`: favored over a positional constructor
/// given the field count (spec.md section 9).
pub struct AdmissionDecisionBuilder {
    metrics: DerivedMetrics,
    rejection_reasons: Vec<String>,
    approval_confidence: f64,
    position_coefficient: f64,
}

impl AdmissionDecisionBuilder {
    fn new(metrics: DerivedMetrics, rejection_reasons: Vec<String>, approval_confidence: f64) -> Self {
        Self {
            metrics,
            rejection_reasons,
            approval_confidence,
            position_coefficient: 0.1,
        }
    }

    pub fn position_coefficient(mut self, coefficient: f64) -> Self {
        self.position_coefficient = coefficient;
        self
    }

    pub fn build(self) -> AdmissionDecision {
        let hash = decision_hash(&self.metrics);
        AdmissionDecision {
            timestamp: Utc::now(),
            decision: self.metrics.decision,
            approval_confidence: self.approval_confidence,
            critical_errors: self.metrics.critical_errors,
            p95_latency_ms: self.metrics.p95_latency_ms,
            p99_latency_ms: self.metrics.p99_latency_ms,
            drift_events_24h: self.metrics.drift_events_24h,
            pnl_net_return: self.metrics.pnl_net_return,
            diversity_index: self.metrics.diversity_index,
            rejection_reasons: self.rejection_reasons,
            decision_hash: hash,
            position_coefficient: self.position_coefficient,
        }
    }
}

/// Hex digest of a stable serialization of the checked metrics tuple, fixed
/// field order and fixed float formatting so a re-run on the same inputs
/// reproduces the same hash. Truncated to 16 hex characters.
pub fn decision_hash(metrics: &DerivedMetrics) -> String {
    let canonical = format!(
        "{}|{:.6}|{:.6}|{}|{:.6}|{:.6}|{:?}",
        metrics.critical_errors,
        metrics.p95_latency_ms,
        metrics.p99_latency_ms,
        metrics.drift_events_24h,
        metrics.challenger_f1,
        metrics.diversity_index,
        metrics.decision,
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn recompute_and_verify(decision: &AdmissionDecision, challenger_f1: f64) -> bool {
    let metrics = DerivedMetrics {
        critical_errors: decision.critical_errors,
        p95_latency_ms: decision.p95_latency_ms,
        p99_latency_ms: decision.p99_latency_ms,
        drift_events_24h: decision.drift_events_24h,
        challenger_f1,
        diversity_index: decision.diversity_index,
        pnl_net_return: decision.pnl_net_return,
        decision: decision.decision,
    };
    decision_hash(&metrics) == decision.decision_hash
}

fn percentile(mut values: Vec<f64>, p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((p / 100.0) * (values.len() as f64 - 1.0)).round() as usize;
    values[idx.min(values.len() - 1)]
}

/// The maximum number of PSI->=0.25 events observed in any rolling
/// 24-hour sub-window, computed by sliding reference/current windows of
/// `DRIFT_WINDOW` signals across the ordered record set.
fn max_drift_events_in_any_24h_window(records: &[SignalRecord]) -> u64 {
    if records.len() <= DRIFT_WINDOW {
        return 0;
    }
    let reference: Vec<i8> = records[..DRIFT_WINDOW].iter().map(|r| r.signal).collect();
    let mut event_times: Vec<DateTime<Utc>> = Vec::new();
    for end in DRIFT_WINDOW..records.len() {
        let start = end.saturating_sub(DRIFT_WINDOW);
        let window: Vec<i8> = records[start..end].iter().map(|r| r.signal).collect();
        let psi = population_stability_index(&reference, &window);
        if psi >= PSI_THRESHOLD {
            event_times.push(records[end].timestamp_log);
        }
    }
    if event_times.is_empty() {
        return 0;
    }
    event_times.sort();
    let mut max_count = 0u64;
    let mut left = 0usize;
    for right in 0..event_times.len() {
        while event_times[right] - event_times[left] > ChronoDuration::hours(24) {
            left += 1;
        }
        max_count = max_count.max((right - left + 1) as u64);
    }
    max_count
}

/// Simulated net return: each non-zero signal enters a one-unit position at
/// the recorded price, closed at the next opposite-or-zero signal, minus a
/// configurable slippage deduction per round trip.
fn simulated_pnl_net_return(records: &[SignalRecord], slippage_pips: f64) -> f64 {
    let slippage = slippage_pips * PIP;
    let mut total = 0.0;
    let mut open: Option<(i8, f64)> = None;
    for record in records {
        match (open, record.signal) {
            (None, s) if s != 0 => {
                open = Some((s, record.price));
            }
            (Some((side, entry_price)), s) if s == 0 || s == -side => {
                let direction = side as f64;
                total += direction * (record.price - entry_price) - slippage;
                open = if s == 0 {
                    None
                } else {
                    Some((s, record.price))
                };
            }
            _ => {}
        }
    }
    total
}

pub struct AdmissionEngine {
    slippage_pips: f64,
}

impl Default for AdmissionEngine {
    fn default() -> Self {
        Self {
            slippage_pips: DEFAULT_SLIPPAGE_PIPS,
        }
    }
}

impl AdmissionEngine {
    pub fn new(slippage_pips: f64) -> Self {
        Self { slippage_pips }
    }

    pub fn evaluate(
        &self,
        records: &[SignalRecord],
        report: &ComparisonReport,
    ) -> AdmissionDecisionBuilder {
        let latencies_ms: Vec<f64> = records
            .iter()
            .map(|r| r.latency().num_microseconds().unwrap_or(0) as f64 / 1000.0)
            .collect();
        let p95 = percentile(latencies_ms.clone(), 95.0);
        let p99 = percentile(latencies_ms.clone(), 99.0);
        let critical_errors = latencies_ms
            .iter()
            .filter(|&&ms| ms > CRITICAL_LATENCY_MS)
            .count() as u64;
        let drift_events_24h = max_drift_events_in_any_24h_window(records);
        let pnl_net_return = simulated_pnl_net_return(records, self.slippage_pips);

        let mut rejection_reasons = Vec::new();
        let mut warnings = 0u32;
        let mut decision = Decision::Go;

        // Rules evaluated in order; the first failing NO-GO rule dominates.
        if critical_errors != 0 {
            rejection_reasons.push("Critical latency event detected".to_string());
            decision = Decision::NoGo;
        } else if p99 >= 100.0 {
            rejection_reasons.push("p99 latency at or above 100ms".to_string());
            decision = Decision::NoGo;
        } else if (drift_events_24h as i64) >= 5 {
            rejection_reasons.push("5 or more drift events within 24h".to_string());
            decision = Decision::NoGo;
        } else {
            if report.challenger_f1 <= 0.5 {
                rejection_reasons.push("Challenger F1 at or below 0.5".to_string());
                warnings += 1;
                decision = Decision::Warning;
            }
            if report.diversity_index <= 0.4 {
                rejection_reasons.push("Diversity index at or below 0.4".to_string());
                warnings += 1;
                decision = Decision::Warning;
            }
        }

        let approval_confidence = match decision {
            Decision::Go => 1.0,
            Decision::Warning => 1.0 - 0.15 * warnings as f64,
            Decision::NoGo => 0.0,
        };

        let metrics = DerivedMetrics {
            critical_errors,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            drift_events_24h,
            challenger_f1: report.challenger_f1,
            diversity_index: report.diversity_index,
            pnl_net_return,
            decision,
        };

        AdmissionDecisionBuilder::new(metrics, rejection_reasons, approval_confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn clean_records(n: usize) -> Vec<SignalRecord> {
        let base = Utc::now();
        (0..n)
            .map(|i| SignalRecord {
                id: i as u64,
                timestamp_signal: base + Duration::seconds(i as i64),
                timestamp_log: base + Duration::seconds(i as i64) + Duration::milliseconds(2),
                symbol: "EURUSD.s".into(),
                signal: 0,
                price: 1.08 + i as f64 * 0.00001,
                confidence: 0.9,
                tick_ref: None,
            })
            .collect()
    }

    #[test]
    fn clean_input_yields_go_with_full_confidence() {
        let engine = AdmissionEngine::default();
        let report = ComparisonReport {
            baseline_f1: 0.5,
            challenger_f1: 0.5985,
            diversity_index: 0.593,
            consistency_rate: 0.9,
        };
        let decision = engine.evaluate(&clean_records(10), &report).build();
        assert_eq!(decision.decision, Decision::Go);
        assert_eq!(decision.approval_confidence, 1.0);
        assert_eq!(decision.decision_hash.len(), 16);
    }

    #[test]
    fn critical_latency_event_forces_no_go() {
        let engine = AdmissionEngine::default();
        let mut records = clean_records(10);
        records[3].timestamp_log = records[3].timestamp_signal + Duration::milliseconds(125);
        let report = ComparisonReport {
            baseline_f1: 0.5,
            challenger_f1: 0.5985,
            diversity_index: 0.593,
            consistency_rate: 0.9,
        };
        let decision = engine.evaluate(&records, &report).build();
        assert_eq!(decision.decision, Decision::NoGo);
        assert!(decision
            .rejection_reasons
            .contains(&"Critical latency event detected".to_string()));

        let clean_decision = engine.evaluate(&clean_records(10), &report).build();
        assert_ne!(decision.decision_hash, clean_decision.decision_hash);
    }

    #[test]
    fn decision_hash_is_pure_function_of_input() {
        let engine = AdmissionEngine::default();
        let records = clean_records(10);
        let report = ComparisonReport {
            baseline_f1: 0.5,
            challenger_f1: 0.5985,
            diversity_index: 0.593,
            consistency_rate: 0.9,
        };
        let a = engine.evaluate(&records, &report).build();
        let b = engine.evaluate(&records, &report).build();
        assert_eq!(a.decision_hash, b.decision_hash);
    }

    #[test]
    fn recompute_and_verify_detects_tampering() {
        let engine = AdmissionEngine::default();
        let report = ComparisonReport {
            baseline_f1: 0.5,
            challenger_f1: 0.5985,
            diversity_index: 0.593,
            consistency_rate: 0.9,
        };
        let mut decision = engine.evaluate(&clean_records(10), &report).build();
        assert!(recompute_and_verify(&decision, 0.5985));
        decision.p99_latency_ms += 1.0;
        assert!(!recompute_and_verify(&decision, 0.5985));
    }
}
