//! Crate-wide error kinds.
//!
//! Safety-relevant failures (gateway BLOCKED, risk breach, reconciliation
//! mismatch) are distinct variants rather than folded into a generic
//! "internal error" so that callers are structurally obligated to route
//! them to the circuit breaker instead of swallowing them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("gateway request {action} timed out after {elapsed_ms}ms")]
    GatewayTimeout { action: String, elapsed_ms: u64 },

    #[error("gateway blocked: {reason}")]
    GatewayBlocked { reason: String },

    #[error("gateway transport error: {0}")]
    GatewayTransport(String),

    #[error("gateway reply req_id mismatch: expected {expected}, got {got}")]
    CorrelationMismatch { expected: String, got: String },

    #[error("gateway replied with error status: {0}")]
    GatewayRejected(String),

    #[error("risk breach: {0}")]
    RiskBreach(String),

    #[error("per-symbol exposure cap exceeded for {symbol}: {requested} > {cap}")]
    RiskCapExceeded {
        symbol: String,
        requested: f64,
        cap: f64,
    },

    #[error("reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    #[error("config validation failed: {0}")]
    ConfigInvalid(String),

    #[error("admission rejected: {0:?}")]
    AdmissionRejected(Vec<String>),

    #[error("decision hash mismatch: artifact tampered or stale")]
    DecisionHashMismatch,

    #[error("canary order failed: {0}")]
    CanaryFailed(String),

    #[error("circuit breaker persistence unavailable: {0}")]
    CircuitBreakerIo(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Process exit codes per spec.md section 6.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Clean = 0,
    ConfigError = 1,
    AdmissionRejected = 2,
    Blocked = 3,
    CanaryFailed = 4,
    ReconciliationError = 5,
}

impl ExecutorError {
    /// Map an error to the process exit code it should surface as, per §6.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExecutorError::ConfigInvalid(_) => ExitCode::ConfigError,
            ExecutorError::DecisionHashMismatch => ExitCode::ConfigError,
            ExecutorError::AdmissionRejected(_) => ExitCode::AdmissionRejected,
            ExecutorError::GatewayBlocked { .. } => ExitCode::Blocked,
            ExecutorError::CanaryFailed(_) => ExitCode::CanaryFailed,
            ExecutorError::ReconciliationMismatch(_) => ExitCode::ReconciliationError,
            _ => ExitCode::ConfigError,
        }
    }
}
