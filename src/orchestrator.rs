//! Orchestrator (C10): starts N symbol loops concurrently, sharing one
//! gateway client and one circuit breaker between them, and supervises
//! their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::gateway::GatewayClient;
use crate::metrics_aggregator::MetricsAggregator;
use crate::models::{SymbolConfig, Tick};
use crate::risk::RiskMonitor;
use crate::sensors::{DriftSensor, LatencySensor};
use crate::shadow_recorder::ShadowRecorder;
use crate::signal_adapter::{AdapterConfig, SignalAdapter, SignalModel};
use crate::symbol_loop::{ExecutionMode, SymbolLoop};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    gateway: Arc<GatewayClient>,
    breaker: Arc<CircuitBreaker>,
    risk_monitor: Arc<RiskMonitor>,
    aggregator: Arc<MetricsAggregator>,
    recorder: Arc<ShadowRecorder>,
    latency_sensor: Arc<LatencySensor>,
    drift_sensor: Arc<DriftSensor>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    tick_senders: Vec<(String, tokio::sync::mpsc::Sender<Tick>)>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<GatewayClient>,
        breaker: Arc<CircuitBreaker>,
        risk_monitor: Arc<RiskMonitor>,
        aggregator: Arc<MetricsAggregator>,
        recorder: Arc<ShadowRecorder>,
        latency_sensor: Arc<LatencySensor>,
        drift_sensor: Arc<DriftSensor>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            gateway,
            breaker,
            risk_monitor,
            aggregator,
            recorder,
            latency_sensor,
            drift_sensor,
            stop_tx,
            handles: Vec::new(),
            tick_senders: Vec::new(),
        }
    }

    /// Spawns one cooperative task per enabled symbol, each running the
    /// state machine in `symbol_loop`. `model_factory` builds a fresh model
    /// instance per symbol since `SignalModel` is not required to be
    /// `Clone`.
    pub fn start<M, F>(
        &mut self,
        symbols: &[SymbolConfig],
        adapter_config: AdapterConfig,
        position_coefficient: f64,
        mode_factory: impl Fn() -> ExecutionMode,
        model_factory: F,
    ) where
        M: SignalModel + 'static,
        F: Fn(&SymbolConfig) -> M,
    {
        for symbol in symbols.iter().filter(|s| s.enabled) {
            let (tx, rx) = tokio::sync::mpsc::channel(1024);
            self.tick_senders.push((symbol.symbol.clone(), tx));

            let adapter = SignalAdapter::new(model_factory(symbol), adapter_config, position_coefficient);
            let mut symbol_loop = SymbolLoop::new(
                symbol.clone(),
                adapter,
                self.gateway.clone(),
                self.risk_monitor.clone(),
                self.aggregator.clone(),
                self.breaker.clone(),
                self.recorder.clone(),
                self.latency_sensor.clone(),
                self.drift_sensor.clone(),
                mode_factory(),
            );
            let stop_rx = self.stop_tx.subscribe();
            let symbol_name = symbol.symbol.clone();
            let handle = tokio::spawn(async move {
                info!(symbol = %symbol_name, "symbol loop starting");
                symbol_loop.run(rx, stop_rx).await;
                info!(symbol = %symbol_name, "symbol loop exited");
            });
            self.handles.push(handle);
        }
    }

    pub fn tick_sender(&self, symbol: &str) -> Option<tokio::sync::mpsc::Sender<Tick>> {
        self.tick_senders
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, tx)| tx.clone())
    }

    /// Awaits every loop's completion. Intended to be run alongside a
    /// shutdown-signal task that calls `shutdown()`.
    pub async fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "symbol loop task panicked");
            }
        }
    }

    /// Broadcasts "stop" to every loop. Each loop completes its current
    /// state transition and exits. If any loop does not exit within the
    /// grace period, the orchestrator aborts the stragglers directly; in
    /// production this is paired with dropping the gateway socket so a
    /// stuck broker round-trip cannot wedge a loop past the deadline.
    pub async fn shutdown(&mut self) {
        let _ = self.stop_tx.send(true);
        self.tick_senders.clear();
        let handles = std::mem::take(&mut self.handles);
        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(SHUTDOWN_GRACE, futures_join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown grace period elapsed, forcing remaining loops to exit");
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "symbol loop task panicked during shutdown");
            }
        }
    }
}
