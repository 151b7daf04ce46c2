//! Metrics Aggregator (C11): a process-wide rollup of PnL and exposure
//! across symbols, guarded by a single lock. Zero-trust input validation:
//! the aggregator never silently normalizes a malformed update.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ExecutorError;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SymbolMetrics {
    pub pnl: f64,
    pub exposure: f64,
    pub trade_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateMetrics {
    pub total_pnl: f64,
    pub total_exposure: f64,
    pub per_symbol: HashMap<String, SymbolMetrics>,
}

pub struct MetricsAggregator {
    known_symbols: Vec<String>,
    inner: Mutex<HashMap<String, SymbolMetrics>>,
}

impl MetricsAggregator {
    pub fn new(known_symbols: Vec<String>) -> Self {
        let mut inner = HashMap::new();
        for symbol in &known_symbols {
            inner.insert(symbol.clone(), SymbolMetrics::default());
        }
        Self {
            known_symbols,
            inner: Mutex::new(inner),
        }
    }

    /// Records a closed trade's realized PnL and its volume. Rejects
    /// non-finite numbers, negative volume, and unknown symbols outright;
    /// the lock is held only for the duration of the in-memory update, never
    /// across I/O.
    pub fn record_trade(&self, symbol: &str, pnl: f64, volume: f64) -> Result<(), ExecutorError> {
        if !self.known_symbols.iter().any(|s| s == symbol) {
            return Err(ExecutorError::ConfigInvalid(format!(
                "unknown symbol in record_trade: {symbol}"
            )));
        }
        if !pnl.is_finite() || !volume.is_finite() {
            return Err(ExecutorError::ConfigInvalid(format!(
                "non-finite value in record_trade for {symbol}: pnl={pnl}, volume={volume}"
            )));
        }
        if volume < 0.0 {
            return Err(ExecutorError::ConfigInvalid(format!(
                "negative volume in record_trade for {symbol}: {volume}"
            )));
        }

        let mut inner = self.inner.lock();
        let entry = inner.entry(symbol.to_string()).or_default();
        entry.pnl += pnl;
        entry.exposure += volume;
        entry.trade_count += 1;
        Ok(())
    }

    pub fn get_symbol_metrics(&self, symbol: &str) -> Option<SymbolMetrics> {
        self.inner.lock().get(symbol).copied()
    }

    /// Returns a deep copy so callers never observe a lock-held reference.
    pub fn get_aggregate_metrics(&self) -> AggregateMetrics {
        let inner = self.inner.lock();
        let total_pnl = inner.values().map(|m| m.pnl).sum();
        let total_exposure = inner.values().map(|m| m.exposure).sum();
        AggregateMetrics {
            total_pnl,
            total_exposure,
            per_symbol: inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_symbol() {
        let agg = MetricsAggregator::new(vec!["EURUSD.s".into()]);
        let err = agg.record_trade("GBPUSD.s", 10.0, 0.1).unwrap_err();
        assert!(matches!(err, ExecutorError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_non_finite_pnl() {
        let agg = MetricsAggregator::new(vec!["EURUSD.s".into()]);
        assert!(agg.record_trade("EURUSD.s", f64::NAN, 0.1).is_err());
    }

    #[test]
    fn rejects_negative_volume() {
        let agg = MetricsAggregator::new(vec!["EURUSD.s".into()]);
        assert!(agg.record_trade("EURUSD.s", 10.0, -0.1).is_err());
    }

    #[test]
    fn aggregate_total_equals_sum_of_per_symbol() {
        let agg = MetricsAggregator::new(vec!["EURUSD.s".into(), "BTCUSD.s".into()]);
        agg.record_trade("EURUSD.s", 10.0, 0.1).unwrap();
        agg.record_trade("BTCUSD.s", -5.0, 0.2).unwrap();
        agg.record_trade("EURUSD.s", 15.0, 0.1).unwrap();

        let aggregate = agg.get_aggregate_metrics();
        let expected: f64 = aggregate.per_symbol.values().map(|m| m.pnl).sum();
        assert_eq!(aggregate.total_pnl, expected);
        assert_eq!(aggregate.total_pnl, 20.0);
    }
}
