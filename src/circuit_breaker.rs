//! Durable, process-external halt state (C1): the single source of truth for
//! "is the system allowed to trade?". Engagement is sticky and survives a
//! crash/restart because the ENGAGED signal is the presence of a file, not an
//! in-memory flag.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Safe,
    Engaged,
}

/// Contents of the persistent circuit-breaker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementRecord {
    pub engaged_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Durable circuit breaker backed by an atomic create-exclusive file.
///
/// `engage` fails closed: if the persistent resource cannot be written (disk
/// full, permission denied), the in-memory state is still forced to
/// `Engaged` and the I/O error is logged as fatal, per spec section 4.1's
/// failure semantics.
pub struct CircuitBreaker {
    path: PathBuf,
    cached: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = if path.exists() {
            BreakerState::Engaged
        } else {
            BreakerState::Safe
        };
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    /// Atomically transitions to ENGAGED if not already; idempotent.
    pub fn engage(&self, reason: impl Into<String>, metadata: serde_json::Value) {
        let reason = reason.into();
        let mut state = self.cached.lock();
        if *state == BreakerState::Engaged {
            return;
        }
        let record = EngagementRecord {
            engaged_at: Utc::now(),
            reason: reason.clone(),
            metadata,
        };
        match self.persist(&record) {
            Ok(()) => {
                error!(reason = %reason, "circuit breaker engaged");
            }
            Err(e) => {
                error!(error = %e, reason = %reason, "circuit breaker persistence failed, falling closed");
            }
        }
        // Fall closed unconditionally: whether or not the write above
        // succeeded, the process must behave as ENGAGED from this point.
        *state = BreakerState::Engaged;
    }

    fn persist(&self, record: &EngagementRecord) -> io::Result<()> {
        use std::fs::OpenOptions;
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Atomic create-exclusive: two racing engagers cannot both "win" the
        // create, so only one of them logs a fresh record; the loser simply
        // observes the file already exists, which is an equally valid
        // ENGAGED signal.
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(e),
        };
        let body = serde_json::to_vec_pretty(record)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }

    /// Administrative disengage. Only valid if the caller has already
    /// obtained operator authorization out-of-band; this method performs no
    /// authorization check of its own.
    pub fn disengage(&self) -> io::Result<()> {
        let mut state = self.cached.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        *state = BreakerState::Safe;
        warn!("circuit breaker disengaged by operator action");
        Ok(())
    }

    pub fn state(&self) -> BreakerState {
        *self.cached.lock()
    }

    pub fn should_halt(&self) -> bool {
        self.state() == BreakerState::Engaged
    }

    /// Reads the engagement record currently on disk, if any.
    pub fn record(&self) -> Option<EngagementRecord> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn startup_log(breaker: &CircuitBreaker) {
    match breaker.state() {
        BreakerState::Safe => info!("circuit breaker state at startup: SAFE"),
        BreakerState::Engaged => {
            let reason = breaker
                .record()
                .map(|r| r.reason)
                .unwrap_or_else(|| "unknown".to_string());
            warn!(reason = %reason, "circuit breaker state at startup: ENGAGED (carried over from prior session)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_safe_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = CircuitBreaker::new(dir.path().join("halt.lock"));
        assert_eq!(breaker.state(), BreakerState::Safe);
        assert!(!breaker.should_halt());
    }

    #[test]
    fn engage_is_sticky_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = CircuitBreaker::new(dir.path().join("halt.lock"));
        breaker.engage("CRITICAL_DRAWDOWN", json!({"drawdown_pct": 0.027}));
        assert!(breaker.should_halt());
        let first = breaker.record().unwrap();
        // A second engage call must not overwrite the persisted reason.
        breaker.engage("LEVERAGE_BREACH", json!({}));
        let second = breaker.record().unwrap();
        assert_eq!(first.reason, second.reason);
    }

    #[test]
    fn survives_restart_via_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halt.lock");
        {
            let breaker = CircuitBreaker::new(&path);
            breaker.engage("LOOP_INSTABILITY", json!({}));
        }
        let restarted = CircuitBreaker::new(&path);
        assert_eq!(restarted.state(), BreakerState::Engaged);
    }

    #[test]
    fn disengage_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = CircuitBreaker::new(dir.path().join("halt.lock"));
        breaker.engage("CANARY_FAILED", json!({}));
        breaker.disengage().unwrap();
        assert_eq!(breaker.state(), BreakerState::Safe);
        assert!(breaker.record().is_none());
    }
}
