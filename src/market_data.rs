//! Market Data Subscriber (C3): a publish/subscribe consumer of ticks with
//! per-symbol dispatch, bounded buffering, and lag-based circuit-breaker
//! engagement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::models::Tick;

/// Repeated lag above this many dropped ticks (cumulative) engages the
/// circuit breaker; delivery is at-least-once and consumers must tolerate
/// duplicates, but a subscriber that cannot keep up at all is a sign the
/// scheduler is starved.
const LAG_ENGAGE_THRESHOLD: u64 = 50;

#[derive(Debug, Default)]
pub struct SubscriberStats {
    pub lag_drops: AtomicU64,
    pub received: AtomicU64,
}

/// Per-symbol bounded tick queue. The channel capacity is the buffer size
/// (default 1024); when full, the oldest buffered tick is dropped by
/// draining one slot before pushing the newest, and the lag counter
/// increments.
pub struct SymbolQueue {
    pub symbol: String,
    sender: mpsc::Sender<Tick>,
    pub receiver: tokio::sync::Mutex<mpsc::Receiver<Tick>>,
}

pub struct MarketDataSubscriber {
    queues: HashMap<String, Arc<SymbolQueue>>,
    stats: Arc<SubscriberStats>,
    breaker: Arc<CircuitBreaker>,
}

impl MarketDataSubscriber {
    pub fn new(symbols: &[String], buffer_size: usize, breaker: Arc<CircuitBreaker>) -> Self {
        let mut queues = HashMap::new();
        for symbol in symbols {
            let (tx, rx) = mpsc::channel(buffer_size);
            queues.insert(
                symbol.clone(),
                Arc::new(SymbolQueue {
                    symbol: symbol.clone(),
                    sender: tx,
                    receiver: tokio::sync::Mutex::new(rx),
                }),
            );
        }
        Self {
            queues,
            stats: Arc::new(SubscriberStats::default()),
            breaker,
        }
    }

    pub fn queue(&self, symbol: &str) -> Option<Arc<SymbolQueue>> {
        self.queues.get(symbol).cloned()
    }

    pub fn stats(&self) -> Arc<SubscriberStats> {
        self.stats.clone()
    }

    /// Dispatches a raw tick to its symbol's queue (the subscribe filter is
    /// the union of enabled symbols; an unrecognized symbol is silently
    /// ignored rather than routed anywhere). Drops the oldest buffered tick
    /// if the queue is full.
    pub fn dispatch(&self, tick: Tick) {
        let Some(queue) = self.queues.get(&tick.symbol) else {
            return;
        };
        let symbol = tick.symbol.clone();
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match queue.sender.try_send(tick) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(tick)) => {
                let _ = queue.receiver.try_lock().ok().and_then(|mut r| r.try_recv().ok());
                let _ = queue.sender.try_send(tick);
                let drops = self.stats.lag_drops.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(symbol = %symbol, drops, "market data lag: dropped oldest buffered tick");
                if drops >= LAG_ENGAGE_THRESHOLD {
                    error!(symbol = %symbol, drops, "repeated market data lag, engaging circuit breaker");
                    self.breaker.engage(
                        "MARKET_DATA_LAG",
                        serde_json::json!({"symbol": symbol, "lag_drops": drops}),
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(symbol = %symbol, "market data queue closed, receiver gone");
            }
        }
    }

    /// Reads one length-prefixed JSON tick frame from a connected market
    /// data socket (topic = symbol, payload = `{symbol, bid, ask,
    /// timestamp}`).
    pub async fn read_wire_tick(stream: &mut TcpStream) -> std::io::Result<Tick> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn breaker() -> Arc<CircuitBreaker> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(CircuitBreaker::new(dir.path().join("halt.lock")))
    }

    #[tokio::test]
    async fn delivers_ticks_in_publisher_order() {
        let sub = MarketDataSubscriber::new(&["EURUSD.s".into()], 1024, breaker());
        for i in 0..5 {
            sub.dispatch(Tick {
                symbol: "EURUSD.s".into(),
                bid: 1.08500 + i as f64 * 0.0001,
                ask: 1.08520 + i as f64 * 0.0001,
                timestamp: Utc::now(),
            });
        }
        let queue = sub.queue("EURUSD.s").unwrap();
        let mut rx = queue.receiver.lock().await;
        let mut seen = vec![];
        while let Ok(tick) = rx.try_recv() {
            seen.push(tick.bid);
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn unknown_symbol_is_ignored() {
        let sub = MarketDataSubscriber::new(&["EURUSD.s".into()], 1024, breaker());
        sub.dispatch(Tick {
            symbol: "GBPUSD.s".into(),
            bid: 1.0,
            ask: 1.0,
            timestamp: Utc::now(),
        });
        assert_eq!(sub.stats().received.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn engages_breaker_after_repeated_lag() {
        let b = breaker();
        let sub = MarketDataSubscriber::new(&["EURUSD.s".into()], 1, b.clone());
        for i in 0..(LAG_ENGAGE_THRESHOLD + 5) {
            sub.dispatch(Tick {
                symbol: "EURUSD.s".into(),
                bid: 1.0 + i as f64,
                ask: 1.0 + i as f64,
                timestamp: Utc::now(),
            });
        }
        assert!(b.should_halt());
    }
}
