//! Shared data model types used across the executor: symbol configuration,
//! order intents, and broker deals/fills.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-symbol configuration, an element of the active symbol set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolConfig {
    /// Broker-specific identifier, e.g. "EURUSD.s". Unique within the active set.
    pub symbol: String,
    /// Default order volume, in lots.
    pub lot_size: f64,
    /// Broker-side tag used to filter this system's own orders.
    pub magic_number: i64,
    /// Fraction of equity this symbol may hold open at once.
    pub max_per_symbol_exposure: f64,
    pub enabled: bool,
    /// Contract size (units per lot); 100_000 for a typical FX major.
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,
    /// Minimum tradeable volume increment, used by the signal adapter's sizing.
    #[serde(default = "default_volume_step")]
    pub volume_step: f64,
}

fn default_contract_size() -> f64 {
    100_000.0
}

fn default_volume_step() -> f64 {
    0.01
}

impl SymbolConfig {
    /// Validates the symbol identifier and the per-symbol numeric invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_symbol_identifier(&self.symbol) {
            return Err(format!("invalid symbol identifier: {}", self.symbol));
        }
        if !(self.max_per_symbol_exposure > 0.0) {
            return Err(format!(
                "{}: max_per_symbol_exposure must be > 0, got {}",
                self.symbol, self.max_per_symbol_exposure
            ));
        }
        if self.lot_size <= 0.0 {
            return Err(format!(
                "{}: lot_size must be positive, got {}",
                self.symbol, self.lot_size
            ));
        }
        if self.contract_size <= 0.0 {
            return Err(format!("{}: contract_size must be positive", self.symbol));
        }
        if self.volume_step <= 0.0 {
            return Err(format!("{}: volume_step must be positive", self.symbol));
        }
        Ok(())
    }
}

/// Matches `^[A-Z]{3,8}(\.[a-z])?$`.
pub fn is_valid_symbol_identifier(symbol: &str) -> bool {
    let (base, suffix) = match symbol.find('.') {
        Some(idx) => (&symbol[..idx], Some(&symbol[idx + 1..])),
        None => (symbol, None),
    };
    if symbol.bytes().filter(|&b| b == b'.').count() > 1 {
        return false;
    }
    if base.len() < 3 || base.len() > 8 || !base.bytes().all(|b| b.is_ascii_uppercase()) {
        return false;
    }
    match suffix {
        None => true,
        Some(s) => s.len() == 1 && s.bytes().all(|b| b.is_ascii_lowercase()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Maps the {-1, 0, +1} signal convention; `0` (flat) has no side.
    pub fn from_signal(signal: i8) -> Option<Side> {
        match signal {
            1 => Some(Side::Buy),
            -1 => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order intent produced by the signal adapter (C8), consumed by the symbol
/// loop (C9) on its way to the gateway client (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub magic_number: i64,
    pub client_order_id: Uuid,
    pub comment: Option<String>,
}

impl OrderIntent {
    pub fn new(symbol: impl Into<String>, side: Side, volume: f64, magic_number: i64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            volume,
            stop_loss: None,
            take_profit: None,
            magic_number,
            client_order_id: Uuid::new_v4(),
            comment: None,
        }
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}

/// A broker-reported deal/fill, returned by `GET_HISTORY` or the data payload
/// of a successful `OPEN_ORDER`/`CLOSE_ORDER` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: i64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub commission: f64,
    pub swap: f64,
    pub profit: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub magic_number: i64,
    /// The client_order_id this deal's order carried, when known locally.
    #[serde(default)]
    pub client_order_id: Option<Uuid>,
}

/// A raw account snapshot, as reported by `GET_ACCOUNT` or embedded in a tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
}

/// A market-data tick (wire payload: `{symbol, bid, ask, timestamp}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_standard_fx_symbol() {
        assert!(is_valid_symbol_identifier("EURUSD.s"));
        assert!(is_valid_symbol_identifier("EUR"));
        assert!(is_valid_symbol_identifier("BTCUSDT"));
    }

    #[test]
    fn rejects_malformed_symbols() {
        assert!(!is_valid_symbol_identifier("eurusd.s"));
        assert!(!is_valid_symbol_identifier("EU"));
        assert!(!is_valid_symbol_identifier("TOOLONGSYM"));
        assert!(!is_valid_symbol_identifier("EURUSD.ss"));
        assert!(!is_valid_symbol_identifier("EURUSD.S"));
        assert!(!is_valid_symbol_identifier("EUR.US.s"));
    }

    #[test]
    fn symbol_config_rejects_zero_exposure() {
        let cfg = SymbolConfig {
            symbol: "EURUSD.s".into(),
            lot_size: 0.1,
            magic_number: 1001,
            max_per_symbol_exposure: 0.0,
            enabled: true,
            contract_size: 100_000.0,
            volume_step: 0.01,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn side_from_signal_maps_correctly() {
        assert_eq!(Side::from_signal(1), Some(Side::Buy));
        assert_eq!(Side::from_signal(-1), Some(Side::Sell));
        assert_eq!(Side::from_signal(0), None);
    }
}
