//! Shadow Recorder (C12): an append-only record of every signal evaluated
//! in shadow mode, for later admission analysis.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

const FLUSH_RECORD_THRESHOLD: usize = 1000;
const FLUSH_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: u64,
    pub timestamp_signal: DateTime<Utc>,
    pub timestamp_log: DateTime<Utc>,
    pub symbol: String,
    pub signal: i8,
    pub price: f64,
    pub confidence: f64,
    #[serde(default)]
    pub tick_ref: Option<u64>,
}

impl SignalRecord {
    pub fn latency(&self) -> chrono::Duration {
        self.timestamp_log - self.timestamp_signal
    }
}

struct State {
    next_id: u64,
    pending: Vec<SignalRecord>,
    current_day: NaiveDate,
}

/// Newline-delimited JSON, rotated by UTC day. Writes are buffered in
/// memory and flushed to disk on a size or time threshold, whichever comes
/// first.
pub struct ShadowRecorder {
    dir: PathBuf,
    state: Mutex<State>,
}

impl ShadowRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            state: Mutex::new(State {
                next_id: 0,
                pending: Vec::with_capacity(FLUSH_RECORD_THRESHOLD),
                current_day: Utc::now().date_naive(),
            }),
        })
    }

    fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("shadow-{}.ndjson", day.format("%Y-%m-%d")))
    }

    /// Appends one evaluated signal. May trigger an immediate flush if the
    /// size threshold is crossed.
    pub fn record(
        &self,
        timestamp_signal: DateTime<Utc>,
        symbol: &str,
        signal: i8,
        price: f64,
        confidence: f64,
        tick_ref: Option<u64>,
    ) -> std::io::Result<SignalRecord> {
        let timestamp_log = Utc::now();
        let mut state = self.state.lock();
        let record = SignalRecord {
            id: state.next_id,
            timestamp_signal,
            timestamp_log,
            symbol: symbol.to_string(),
            signal,
            price,
            confidence,
            tick_ref,
        };
        state.next_id += 1;
        state.pending.push(record.clone());
        if state.pending.len() >= FLUSH_RECORD_THRESHOLD {
            self.flush_locked(&mut state)?;
        }
        Ok(record)
    }

    fn flush_locked(&self, state: &mut State) -> std::io::Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let today = Utc::now().date_naive();
        if today != state.current_day {
            state.current_day = today;
        }
        let path = self.path_for(state.current_day);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        for record in state.pending.drain(..) {
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{line}")?;
        }
        file.sync_data()?;
        info!(path = %path.display(), "shadow recorder flushed");
        Ok(())
    }

    pub fn flush(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// A periodic timer-driven flush loop, run alongside the symbol loops.
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(FLUSH_PERIOD);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "shadow recorder periodic flush failed");
            }
        }
    }

    pub fn active_file(&self) -> PathBuf {
        self.path_for(self.state.lock().current_day)
    }
}

/// Reads all records for one rotation day back off disk, for admission
/// analysis.
pub fn read_records(path: &Path) -> std::io::Result<Vec<SignalRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}
