//! Symbol Loop (C9): the per-symbol cooperative task tying subscription,
//! evaluation, submission, and accounting together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::gateway::{Action, GatewayClient};
use crate::metrics_aggregator::MetricsAggregator;
use crate::models::{OrderIntent, SymbolConfig, Tick};
use crate::risk::RiskMonitor;
use crate::sensors::{DriftSensor, LatencySensor};
use crate::shadow_recorder::ShadowRecorder;
use crate::signal_adapter::{SignalAdapter, SignalAdapterInput, SignalModel};

const LOOP_INSTABILITY_THRESHOLD: usize = 5;
const LOOP_INSTABILITY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    WaitTick,
    Eval,
    Submit,
    Settle,
    Halt,
}

#[derive(Debug, Default)]
pub struct SymbolLoopMetrics {
    pub risk_blocked: AtomicU64,
    pub orders_submitted: AtomicU64,
    pub loop_errors: AtomicU64,
}

pub enum ExecutionMode {
    /// Signals are recorded instead of sent to the gateway; C9 calls the
    /// recorder in place of C2's order actions.
    Shadow,
    Live,
}

pub struct SymbolLoop<M: SignalModel> {
    config: SymbolConfig,
    adapter: SignalAdapter<M>,
    gateway: Arc<GatewayClient>,
    risk_monitor: Arc<RiskMonitor>,
    aggregator: Arc<MetricsAggregator>,
    breaker: Arc<CircuitBreaker>,
    recorder: Arc<ShadowRecorder>,
    latency_sensor: Arc<LatencySensor>,
    drift_sensor: Arc<DriftSensor>,
    mode: ExecutionMode,
    metrics: Arc<SymbolLoopMetrics>,
    current_exposure: f64,
    recent_failures: VecDeque<std::time::Instant>,
    pending_tick: Option<Tick>,
    pending_order: Option<OrderIntent>,
    settled_order: Option<OrderIntent>,
}

impl<M: SignalModel> SymbolLoop<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SymbolConfig,
        adapter: SignalAdapter<M>,
        gateway: Arc<GatewayClient>,
        risk_monitor: Arc<RiskMonitor>,
        aggregator: Arc<MetricsAggregator>,
        breaker: Arc<CircuitBreaker>,
        recorder: Arc<ShadowRecorder>,
        latency_sensor: Arc<LatencySensor>,
        drift_sensor: Arc<DriftSensor>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            config,
            adapter,
            gateway,
            risk_monitor,
            aggregator,
            breaker,
            recorder,
            latency_sensor,
            drift_sensor,
            mode,
            metrics: Arc::new(SymbolLoopMetrics::default()),
            current_exposure: 0.0,
            recent_failures: VecDeque::new(),
            pending_tick: None,
            pending_order: None,
            settled_order: None,
        }
    }

    pub fn metrics(&self) -> Arc<SymbolLoopMetrics> {
        self.metrics.clone()
    }

    /// Runs the state machine until `stop` is signalled or the loop enters
    /// HALT. Ticks are pulled from `ticks`; a tick must belong to this
    /// loop's symbol (the caller routes by symbol).
    pub async fn run(
        &mut self,
        mut ticks: tokio::sync::mpsc::Receiver<Tick>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut state = LoopState::Idle;
        loop {
            state = match state {
                LoopState::Idle => LoopState::WaitTick,
                LoopState::WaitTick => {
                    if self.breaker.should_halt() {
                        LoopState::Halt
                    } else {
                        tokio::select! {
                            _ = stop.changed() => {
                                if *stop.borrow() {
                                    info!(symbol = %self.config.symbol, "symbol loop stopping on signal");
                                    return;
                                }
                                LoopState::WaitTick
                            }
                            tick = ticks.recv() => {
                                match tick {
                                    Some(tick) => {
                                        self.pending_tick = Some(tick);
                                        LoopState::Eval
                                    }
                                    None => {
                                        info!(symbol = %self.config.symbol, "tick channel closed, stopping");
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
                LoopState::Eval => self.eval(),
                LoopState::Submit => self.submit().await,
                LoopState::Settle => {
                    self.settle();
                    LoopState::WaitTick
                }
                LoopState::Halt => {
                    warn!(symbol = %self.config.symbol, "symbol loop halted: circuit breaker engaged");
                    return;
                }
            };
        }
    }

    fn eval(&mut self) -> LoopState {
        let Some(tick) = self.pending_tick.take() else {
            return LoopState::WaitTick;
        };
        let snapshot = self.risk_monitor.snapshot();
        let input = SignalAdapterInput {
            features: &[],
            balance: snapshot.balance,
            current_price: tick.mid(),
            stop_distance: 0.0010,
            symbol: &self.config.symbol,
            magic_number: self.config.magic_number,
        };
        let eval_start = std::time::Instant::now();
        let output = self.adapter.evaluate(&input);
        self.latency_sensor
            .observe(eval_start.elapsed().as_secs_f64() * 1000.0);
        self.drift_sensor.observe(output.signal, tick.timestamp);

        if matches!(self.mode, ExecutionMode::Shadow) {
            if let Err(e) = self.recorder.record(
                tick.timestamp,
                &self.config.symbol,
                output.signal,
                tick.mid(),
                output.score,
                None,
            ) {
                error!(symbol = %self.config.symbol, error = %e, "failed to record shadow signal");
            }
        }

        if let Some(order) = output.order {
            let cap = self.config.max_per_symbol_exposure * snapshot.equity;
            if self.current_exposure + order.volume <= cap {
                self.pending_order = Some(order);
                return LoopState::Submit;
            }
            self.metrics.risk_blocked.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %self.config.symbol, "per-symbol exposure cap exceeded, order skipped");
        }
        LoopState::Settle
    }

    async fn submit(&mut self) -> LoopState {
        let Some(order) = self.pending_order.take() else {
            return LoopState::Settle;
        };

        match self.mode {
            ExecutionMode::Shadow => {
                self.current_exposure += order.volume;
                self.settled_order = Some(order);
                LoopState::Settle
            }
            ExecutionMode::Live => {
                let payload = serde_json::json!({
                    "symbol": &order.symbol,
                    "side": order.side,
                    "volume": order.volume,
                    "sl": order.stop_loss,
                    "tp": order.take_profit,
                    "magic": order.magic_number,
                    "client_order_id": order.client_order_id,
                    "comment": &order.comment,
                });
                match self.gateway.call(Action::OpenOrder, payload).await {
                    Ok(_reply) => {
                        self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
                        self.current_exposure += order.volume;
                        self.settled_order = Some(order);
                        LoopState::Settle
                    }
                    Err(crate::error::ExecutorError::GatewayBlocked { reason }) => {
                        error!(symbol = %self.config.symbol, reason, "gateway BLOCKED, halting loop");
                        self.breaker.engage(
                            "GATEWAY_BLOCKED",
                            serde_json::json!({"symbol": self.config.symbol, "reason": reason}),
                        );
                        LoopState::Halt
                    }
                    Err(e) => {
                        self.record_failure();
                        error!(symbol = %self.config.symbol, error = %e, "order submission failed");
                        LoopState::Settle
                    }
                }
            }
        }
    }

    fn settle(&mut self) {
        if let Some(order) = self.settled_order.take() {
            // Realized PnL is unknown until the position closes; an opened
            // order updates exposure and trade count with a zero PnL delta.
            if let Err(e) = self.aggregator.record_trade(&order.symbol, 0.0, order.volume) {
                error!(symbol = %self.config.symbol, error = %e, "failed to record trade in aggregator");
            }
        }
        debug!(symbol = %self.config.symbol, exposure = self.current_exposure, "settled");
    }

    fn record_failure(&mut self) {
        self.metrics.loop_errors.fetch_add(1, Ordering::Relaxed);
        let now = std::time::Instant::now();
        self.recent_failures.push_back(now);
        while let Some(front) = self.recent_failures.front() {
            if now.duration_since(*front) > LOOP_INSTABILITY_WINDOW {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
        if self.recent_failures.len() >= LOOP_INSTABILITY_THRESHOLD {
            error!(symbol = %self.config.symbol, "repeated loop failures, engaging circuit breaker");
            self.breaker.engage(
                "LOOP_INSTABILITY",
                serde_json::json!({"symbol": self.config.symbol, "failures": self.recent_failures.len()}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_adapter::{AdapterConfig, ConstantModel};
    use tokio::sync::mpsc;

    fn symbol_config() -> SymbolConfig {
        SymbolConfig {
            symbol: "EURUSD.s".into(),
            lot_size: 0.1,
            magic_number: 1001,
            max_per_symbol_exposure: 0.2,
            enabled: true,
            contract_size: 100_000.0,
            volume_step: 0.01,
        }
    }

    struct Fixture {
        loop_: SymbolLoop<ConstantModel>,
        aggregator: Arc<MetricsAggregator>,
        recorder: Arc<ShadowRecorder>,
        _dir: tempfile::TempDir,
    }

    fn new_loop(score: f64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let breaker = Arc::new(CircuitBreaker::new(dir.path().join("halt.lock")));
        let risk_monitor = Arc::new(RiskMonitor::new(
            crate::config::RiskLimitsConfig::default(),
            breaker.clone(),
        ));
        risk_monitor.on_tick(crate::models::AccountSnapshot {
            balance: 100_000.0,
            equity: 100_000.0,
            margin: 0.0,
            free_margin: 100_000.0,
        });
        let aggregator = Arc::new(MetricsAggregator::new(vec!["EURUSD.s".into()]));
        let recorder = Arc::new(ShadowRecorder::new(dir.path().join("shadow")).unwrap());
        let gateway = Arc::new(GatewayClient::new("127.0.0.1:1", Duration::from_millis(50)));
        let adapter = SignalAdapter::new(ConstantModel(score), AdapterConfig::default(), 1.0);
        let latency_sensor = Arc::new(crate::sensors::LatencySensor::new(
            crate::sensors::LatencySensorConfig::default(),
            breaker.clone(),
        ));
        let drift_sensor = Arc::new(crate::sensors::DriftSensor::default_with_breaker(breaker.clone()));
        let loop_ = SymbolLoop::new(
            symbol_config(),
            adapter,
            gateway,
            risk_monitor,
            aggregator.clone(),
            breaker,
            recorder.clone(),
            latency_sensor,
            drift_sensor,
            ExecutionMode::Shadow,
        );
        Fixture {
            loop_,
            aggregator,
            recorder,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn idle_tick_stream_ends_the_loop_when_channel_closes() {
        let mut fixture = new_loop(0.5);
        let (tx, rx) = mpsc::channel::<Tick>(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(tx);
        fixture.loop_.run(rx, stop_rx).await;
    }

    #[tokio::test]
    async fn a_buy_signal_in_shadow_mode_records_instead_of_submitting() {
        let mut fixture = new_loop(0.9);
        let (tx, rx) = mpsc::channel::<Tick>(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        tx.send(Tick {
            symbol: "EURUSD.s".into(),
            bid: 1.0850,
            ask: 1.0852,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
        drop(tx);
        fixture.loop_.run(rx, stop_rx).await;
        let _ = stop_tx;
        assert_eq!(fixture.loop_.metrics.orders_submitted.load(Ordering::Relaxed), 0);

        let metrics = fixture.aggregator.get_symbol_metrics("EURUSD.s").unwrap();
        assert_eq!(metrics.trade_count, 1);
        assert_eq!(metrics.pnl, 0.0);
        assert!(metrics.exposure > 0.0);
    }

    #[tokio::test]
    async fn every_flat_signal_in_shadow_mode_is_recorded_with_true_fields() {
        let mut fixture = new_loop(0.5);
        let (tx, rx) = mpsc::channel::<Tick>(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let timestamp = Utc::now();
        for i in 0..10 {
            tx.send(Tick {
                symbol: "EURUSD.s".into(),
                bid: 1.08500 + i as f64 * 0.00001,
                ask: 1.08520 + i as f64 * 0.00001,
                timestamp,
            })
            .await
            .unwrap();
        }
        drop(tx);
        fixture.loop_.run(rx, stop_rx).await;
        let _ = stop_tx;

        fixture.recorder.flush().unwrap();
        let records = crate::shadow_recorder::read_records(&fixture.recorder.active_file()).unwrap();
        assert_eq!(records.len(), 10);
        for record in &records {
            assert_eq!(record.signal, 0);
            assert_eq!(record.confidence, 0.5);
            assert_eq!(record.timestamp_signal, timestamp);
        }

        let metrics = fixture.aggregator.get_symbol_metrics("EURUSD.s").unwrap();
        assert_eq!(metrics.trade_count, 0);
        assert_eq!(metrics.pnl, 0.0);
    }
}
