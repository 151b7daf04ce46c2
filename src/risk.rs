//! Risk Monitor (C5): maintains account state, evaluates drawdown and
//! leverage on every update, and engages the circuit breaker on breach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::RiskLimitsConfig;
use crate::models::AccountSnapshot;

/// Immutable snapshot read by symbol loops (spec.md section 9: loops read an
/// immutable `AccountStateSnapshot` produced by the risk monitor; they never
/// write account state directly).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountStateSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub leverage: f64,
}

impl AccountStateSnapshot {
    fn initial() -> Self {
        Self {
            balance: 0.0,
            equity: 0.0,
            margin: 0.0,
            free_margin: 0.0,
            peak_equity: 0.0,
            drawdown_pct: 0.0,
            leverage: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskWarning {
    DrawdownWarning,
    LeverageWarning,
}

/// Maintains the account state and evaluates risk thresholds on every
/// update. Once the circuit breaker is engaged, the monitor keeps updating
/// its bookkeeping but stops re-evaluating for re-engagement (the breaker is
/// sticky).
pub struct RiskMonitor {
    limits: RiskLimitsConfig,
    state: RwLock<AccountStateSnapshot>,
    breaker: Arc<CircuitBreaker>,
    already_engaged: AtomicBool,
}

impl RiskMonitor {
    pub fn new(limits: RiskLimitsConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let already_engaged = breaker.should_halt();
        Self {
            limits,
            state: RwLock::new(AccountStateSnapshot::initial()),
            breaker,
            already_engaged: AtomicBool::new(already_engaged),
        }
    }

    pub fn snapshot(&self) -> AccountStateSnapshot {
        *self.state.read()
    }

    /// Updates `balance`/`equity`/`margin`, recomputes derived fields, and
    /// evaluates thresholds. Returns any non-fatal warning raised by this
    /// update (hard breaches engage the breaker directly and return `None`,
    /// since the breach itself is the signal).
    pub fn on_tick(&self, account: AccountSnapshot) -> Option<RiskWarning> {
        let mut state = self.state.write();
        state.balance = account.balance;
        state.equity = account.equity;
        state.margin = account.margin;
        state.free_margin = account.free_margin;

        state.peak_equity = state.peak_equity.max(account.equity);
        state.drawdown_pct = if state.peak_equity > 0.0 {
            (state.peak_equity - state.equity) / state.peak_equity
        } else {
            0.0
        };
        state.leverage = if state.equity > 0.0 {
            state.margin / state.equity
        } else {
            0.0
        };

        let snapshot = *state;
        drop(state);

        if self.already_engaged.load(Ordering::Acquire) {
            return None;
        }
        self.evaluate(snapshot)
    }

    fn evaluate(&self, snapshot: AccountStateSnapshot) -> Option<RiskWarning> {
        // Tie-break: if a single update crosses both warning and hard for
        // the same sensor, the hard engagement takes precedence and the
        // warning is not emitted. Drawdown is checked before leverage,
        // matching the order they are listed in spec.md section 4.5.
        if snapshot.drawdown_pct >= self.limits.max_daily_drawdown {
            self.engage(
                "CRITICAL_DRAWDOWN",
                format!(
                    "Drawdown {:.4} exceeded {:.4}",
                    snapshot.drawdown_pct, self.limits.max_daily_drawdown
                ),
            );
            return None;
        }
        if snapshot.leverage >= self.limits.max_account_leverage {
            self.engage(
                "LEVERAGE_BREACH",
                format!(
                    "Leverage {:.1}x exceeded {:.1}x",
                    snapshot.leverage, self.limits.max_account_leverage
                ),
            );
            return None;
        }
        if snapshot.drawdown_pct >= self.limits.drawdown_warning {
            warn!(drawdown_pct = snapshot.drawdown_pct, "drawdown warning threshold crossed");
            return Some(RiskWarning::DrawdownWarning);
        }
        if snapshot.leverage >= self.limits.leverage_warning {
            warn!(leverage = snapshot.leverage, "leverage warning threshold crossed");
            return Some(RiskWarning::LeverageWarning);
        }
        None
    }

    fn engage(&self, reason: &str, detail: String) {
        error!(reason, detail = %detail, "risk monitor engaging circuit breaker");
        self.already_engaged.store(true, Ordering::Release);
        self.breaker
            .engage(reason, serde_json::json!({ "detail": detail }));
    }
}
