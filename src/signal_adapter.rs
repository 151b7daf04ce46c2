//! Signal Adapter (C8): a pure, deterministic function from a feature
//! snapshot to an order intent.
//!
//! The "model" is a small capability — `predict(features) -> score` — so
//! that trained models, heuristics, and shadow replayers can share this
//! adapter without an inheritance hierarchy (spec.md section 9).

use crate::models::{OrderIntent, Side};

/// Anything that can turn a feature vector into a confidence score in
/// `[0, 1]`.
pub trait SignalModel: Send + Sync {
    fn predict(&self, features: &[f64]) -> f64;
}

/// A fixed linear-weights heuristic: `sigmoid(dot(weights, features) + bias)`.
pub struct WeightedHeuristic {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl SignalModel for WeightedHeuristic {
    fn predict(&self, features: &[f64]) -> f64 {
        let dot: f64 = self
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, f)| w * f)
            .sum();
        1.0 / (1.0 + (-(dot + self.bias)).exp())
    }
}

/// Replays a fixed score regardless of input; used by the shadow-mode
/// record/replay path and by tests.
pub struct ConstantModel(pub f64);

impl SignalModel for ConstantModel {
    fn predict(&self, _features: &[f64]) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterConfig {
    /// Score threshold theta: score > theta => +1, score < 1-theta => -1.
    pub score_threshold: f64,
    pub risk_per_trade: f64,
    pub max_position_size: f64,
    pub volume_step: f64,
    pub contract_size: f64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            risk_per_trade: 0.01,
            max_position_size: 10.0,
            volume_step: 0.01,
            contract_size: 100_000.0,
        }
    }
}

pub struct SignalAdapterInput<'a> {
    pub features: &'a [f64],
    pub balance: f64,
    pub current_price: f64,
    pub stop_distance: f64,
    pub symbol: &'a str,
    pub magic_number: i64,
}

/// The evaluated signal plus, when non-zero, the sized order intent.
pub struct AdapterOutput {
    pub signal: i8,
    pub score: f64,
    pub order: Option<OrderIntent>,
}

pub struct SignalAdapter<M: SignalModel> {
    model: M,
    config: AdapterConfig,
    /// Scales the sized volume; seeded by the launcher from the admission
    /// decision's `position_coefficient` and ramped by operator policy.
    position_coefficient: f64,
}

impl<M: SignalModel> SignalAdapter<M> {
    pub fn new(model: M, config: AdapterConfig, position_coefficient: f64) -> Self {
        Self {
            model,
            config,
            position_coefficient,
        }
    }

    pub fn set_position_coefficient(&mut self, coefficient: f64) {
        self.position_coefficient = coefficient;
    }

    /// Pure evaluation: same inputs produce the same output bit-for-bit. No
    /// I/O is performed here.
    pub fn evaluate(&self, input: &SignalAdapterInput) -> AdapterOutput {
        let score = self.model.predict(input.features);
        let theta = self.config.score_threshold;
        let signal: i8 = if score > theta {
            1
        } else if score < 1.0 - theta {
            -1
        } else {
            0
        };

        let order = Side::from_signal(signal).map(|side| {
            let volume = self.sized_volume(input.balance, input.stop_distance);
            OrderIntent::new(input.symbol, side, volume, input.magic_number)
        });

        AdapterOutput {
            signal,
            score,
            order,
        }
    }

    fn sized_volume(&self, balance: f64, stop_distance: f64) -> f64 {
        let risk_amount = balance * self.config.risk_per_trade * self.position_coefficient;
        let raw = if stop_distance > 0.0 {
            risk_amount / (stop_distance * self.config.contract_size)
        } else {
            0.0
        };
        let stepped = floor_to_step(raw, self.config.volume_step);
        stepped.min(self.config.max_position_size)
    }
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(features: &'a [f64]) -> SignalAdapterInput<'a> {
        SignalAdapterInput {
            features,
            balance: 100_000.0,
            current_price: 1.085,
            stop_distance: 0.0010,
            symbol: "EURUSD.s",
            magic_number: 1001,
        }
    }

    #[test]
    fn score_above_theta_emits_buy_with_sized_volume() {
        let adapter = SignalAdapter::new(ConstantModel(0.9), AdapterConfig::default(), 1.0);
        let out = adapter.evaluate(&input(&[]));
        assert_eq!(out.signal, 1);
        let order = out.order.unwrap();
        assert_eq!(order.side, Side::Buy);
        assert!(order.volume > 0.0);
    }

    #[test]
    fn score_below_one_minus_theta_emits_sell() {
        let adapter = SignalAdapter::new(ConstantModel(0.05), AdapterConfig::default(), 1.0);
        let out = adapter.evaluate(&input(&[]));
        assert_eq!(out.signal, -1);
        assert_eq!(out.order.unwrap().side, Side::Sell);
    }

    #[test]
    fn mid_band_score_is_flat() {
        let adapter = SignalAdapter::new(ConstantModel(0.5), AdapterConfig::default(), 1.0);
        let out = adapter.evaluate(&input(&[]));
        assert_eq!(out.signal, 0);
        assert!(out.order.is_none());
    }

    #[test]
    fn position_coefficient_scales_canary_sizing_down() {
        let full = SignalAdapter::new(ConstantModel(0.9), AdapterConfig::default(), 1.0);
        let canary = SignalAdapter::new(ConstantModel(0.9), AdapterConfig::default(), 0.1);
        let full_volume = full.evaluate(&input(&[])).order.unwrap().volume;
        let canary_volume = canary.evaluate(&input(&[])).order.unwrap().volume;
        assert!(canary_volume <= full_volume);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let adapter = SignalAdapter::new(WeightedHeuristic { weights: vec![0.3, -0.2], bias: 0.1 }, AdapterConfig::default(), 1.0);
        let features = [1.2, -0.4];
        let a = adapter.evaluate(&input(&features));
        let b = adapter.evaluate(&input(&features));
        assert_eq!(a.signal, b.signal);
        assert_eq!(a.score, b.score);
    }
}
