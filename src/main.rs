//! MT5-CRS executor binary: wires the circuit breaker, config center,
//! gateway client, risk/latency/drift sensors, and the per-symbol
//! orchestrator together behind the admission-gated launcher.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mt5_crs_executor::circuit_breaker::{self, CircuitBreaker};
use mt5_crs_executor::config::{self, CliArgs, MarketDataConfig};
use mt5_crs_executor::error::ExitCode;
use mt5_crs_executor::gateway::GatewayClient;
use mt5_crs_executor::launcher;
use mt5_crs_executor::market_data::MarketDataSubscriber;
use mt5_crs_executor::metrics_aggregator::MetricsAggregator;
use mt5_crs_executor::orchestrator::Orchestrator;
use mt5_crs_executor::risk::RiskMonitor;
use mt5_crs_executor::sensors::{DriftSensor, LatencySensor, LatencySensorConfig};
use mt5_crs_executor::shadow_recorder::ShadowRecorder;
use mt5_crs_executor::signal_adapter::{AdapterConfig, WeightedHeuristic};
use mt5_crs_executor::symbol_loop::ExecutionMode;

/// Reconnect delay after a dropped or failed market data connection.
const MARKET_DATA_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connects to the market data publisher and feeds ticks into the
/// subscriber's per-symbol queues, reconnecting indefinitely on error; a
/// dead market data feed is expected to surface through the latency sensor
/// and lag-based circuit breaker engagement, not through process exit.
async fn run_market_data_ingestion(
    config: MarketDataConfig,
    subscriber: Arc<MarketDataSubscriber>,
) {
    loop {
        match tokio::net::TcpStream::connect(&config.endpoint).await {
            Ok(mut stream) => {
                info!(endpoint = %config.endpoint, "connected to market data feed");
                loop {
                    match MarketDataSubscriber::read_wire_tick(&mut stream).await {
                        Ok(tick) => subscriber.dispatch(tick),
                        Err(e) => {
                            warn!(error = %e, "market data connection lost, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, endpoint = %config.endpoint, "market data connection failed, retrying");
            }
        }
        tokio::time::sleep(MARKET_DATA_RECONNECT_DELAY).await;
    }
}

/// Forwards buffered ticks for one symbol from the subscriber's queue into
/// the orchestrator's per-symbol channel until the queue's sender is
/// dropped (process shutdown) or the orchestrator's receiver is gone.
async fn run_symbol_forwarder(
    subscriber: Arc<MarketDataSubscriber>,
    symbol: String,
    orchestrator_tx: tokio::sync::mpsc::Sender<mt5_crs_executor::models::Tick>,
) {
    let Some(queue) = subscriber.queue(&symbol) else {
        warn!(symbol, "no market data queue for symbol, forwarder exiting");
        return;
    };
    loop {
        let tick = {
            let mut rx = queue.receiver.lock().await;
            rx.recv().await
        };
        match tick {
            Some(tick) => {
                if orchestrator_tx.send(tick).await.is_err() {
                    info!(symbol, "orchestrator channel closed, forwarder exiting");
                    return;
                }
            }
            None => {
                info!(symbol, "market data queue closed, forwarder exiting");
                return;
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mt5_crs_executor=info,tokio=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args = CliArgs::parse();
    let code = run(args).await;
    std::process::exit(code as i32);
}

async fn run(args: CliArgs) -> ExitCode {
    let app_config = match config::load(&args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration load failed");
            return ExitCode::ConfigError;
        }
    };

    let breaker_path = app_config
        .common
        .circuit_breaker_path
        .clone()
        .unwrap_or_else(|| "./mt5-crs-executor.halt".to_string());
    let breaker = Arc::new(CircuitBreaker::new(breaker_path));
    circuit_breaker::startup_log(&breaker);

    let config_center = Arc::new(config::ConfigCenter::new(
        args.config_path.clone(),
        app_config.clone(),
    ));
    tokio::spawn(config_center.clone().run_reload_loop(Duration::from_secs(10)));

    let gateway = Arc::new(GatewayClient::new(
        app_config.gateway.endpoint.clone(),
        Duration::from_millis(app_config.gateway.timeout_ms),
    ));

    let risk_monitor = Arc::new(RiskMonitor::new(app_config.risk.clone(), breaker.clone()));
    let latency_sensor = Arc::new(LatencySensor::new(
        LatencySensorConfig::default(),
        breaker.clone(),
    ));
    let drift_sensor = Arc::new(DriftSensor::default_with_breaker(breaker.clone()));

    let known_symbols: Vec<String> = app_config.symbols.iter().map(|s| s.symbol.clone()).collect();
    let aggregator = Arc::new(MetricsAggregator::new(known_symbols));

    let recorder = match ShadowRecorder::new("./shadow-records") {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to initialize shadow recorder");
            return ExitCode::ConfigError;
        }
    };
    tokio::spawn(recorder.clone().run_flush_loop());

    let artifact_path = std::path::PathBuf::from("./admission-decision.json");
    let decision = match launcher::verify_admission_and_environment(
        &artifact_path,
        &gateway,
        0.5985,
    )
    .await
    {
        Ok(d) => d,
        Err(e) => return launcher::handle_fatal(&e),
    };

    let mut orchestrator = Orchestrator::new(
        gateway.clone(),
        breaker.clone(),
        risk_monitor.clone(),
        aggregator.clone(),
        recorder.clone(),
        latency_sensor.clone(),
        drift_sensor.clone(),
    );

    let adapter_config = AdapterConfig {
        score_threshold: app_config.trading.score_threshold,
        risk_per_trade: app_config.trading.risk_per_trade,
        max_position_size: 10.0,
        volume_step: 0.01,
        contract_size: 100_000.0,
    };
    orchestrator.start(
        &app_config.symbols,
        adapter_config,
        decision.position_coefficient,
        || ExecutionMode::Live,
        |_symbol| WeightedHeuristic {
            weights: vec![0.1, -0.1],
            bias: 0.0,
        },
    );

    let enabled_symbols: Vec<String> = app_config
        .symbols
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.symbol.clone())
        .collect();
    let subscriber = Arc::new(MarketDataSubscriber::new(
        &enabled_symbols,
        app_config.market_data.buffer_size_per_symbol,
        breaker.clone(),
    ));
    tokio::spawn(run_market_data_ingestion(
        app_config.market_data.clone(),
        subscriber.clone(),
    ));
    for symbol in &enabled_symbols {
        if let Some(tx) = orchestrator.tick_sender(symbol) {
            tokio::spawn(run_symbol_forwarder(subscriber.clone(), symbol.clone(), tx));
        }
    }

    if let Some(first_symbol) = app_config.symbols.iter().find(|s| s.enabled) {
        if let Err(e) = launcher::submit_canary_order(
            &gateway,
            &breaker,
            &first_symbol.symbol,
            first_symbol.magic_number,
        )
        .await
        {
            orchestrator.shutdown().await;
            return launcher::handle_fatal(&e);
        }
    }

    info!("launcher sequence complete, executor running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    orchestrator.shutdown().await;
    ExitCode::Clean
}
