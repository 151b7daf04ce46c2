//! Launcher (C15): the single admissible entry point into live trading.
//!
//! Startup sequence: read the admission artifact, recompute and verify its
//! hash, abort on NO-GO, verify the broker's trade mode, seed the canary
//! position coefficient, start the orchestrator, fire a canary order, and
//! only then return control to the caller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::admission::{recompute_and_verify, AdmissionDecision, Decision};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ExecutorError, ExitCode};
use crate::gateway::{Action, GatewayClient};
use crate::models::{OrderIntent, Side};

const CANARY_VOLUME: f64 = 0.01;

pub fn read_admission_artifact(path: &Path) -> Result<AdmissionDecision, ExecutorError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Steps 1-4 of the startup sequence: artifact integrity, NO-GO abort, and
/// the live trade-mode guard. Returns the verified decision on success.
pub async fn verify_admission_and_environment(
    artifact_path: &Path,
    gateway: &GatewayClient,
    challenger_f1_for_verification: f64,
) -> Result<AdmissionDecision, ExecutorError> {
    let decision = read_admission_artifact(artifact_path)?;

    if !recompute_and_verify(&decision, challenger_f1_for_verification) {
        error!("admission artifact hash mismatch: tampered or stale");
        return Err(ExecutorError::DecisionHashMismatch);
    }

    if decision.decision == Decision::NoGo {
        return Err(ExecutorError::AdmissionRejected(
            decision.rejection_reasons.clone(),
        ));
    }

    gateway.verify_real_trade_mode().await?;

    info!(
        decision_hash = %decision.decision_hash,
        position_coefficient = decision.position_coefficient,
        "admission verified, proceeding to canary"
    );
    Ok(decision)
}

/// Step 7-8: submits exactly one canary order at the minimum permitted
/// volume and blocks until its reply confirms a fill. Engages the circuit
/// breaker and returns an error if the canary does not fill.
pub async fn submit_canary_order(
    gateway: &GatewayClient,
    breaker: &Arc<CircuitBreaker>,
    symbol: &str,
    magic_number: i64,
) -> Result<(), ExecutorError> {
    let order = OrderIntent::new(symbol, Side::Buy, CANARY_VOLUME, magic_number);
    let payload = serde_json::json!({
        "symbol": order.symbol,
        "side": order.side,
        "volume": order.volume,
        "magic": order.magic_number,
        "client_order_id": order.client_order_id,
        "comment": "canary",
    });

    match gateway.call(Action::OpenOrder, payload).await {
        Ok(reply) => {
            let filled = reply
                .data
                .as_ref()
                .and_then(|d| d.get("ticket"))
                .is_some();
            if filled {
                info!(symbol, "canary order filled");
                Ok(())
            } else {
                breaker.engage(
                    "CANARY_FAILED",
                    serde_json::json!({"symbol": symbol, "reason": "reply carried no ticket"}),
                );
                Err(ExecutorError::CanaryFailed(
                    "canary reply carried no fill confirmation".into(),
                ))
            }
        }
        Err(e) => {
            breaker.engage(
                "CANARY_FAILED",
                serde_json::json!({"symbol": symbol, "reason": e.to_string()}),
            );
            Err(ExecutorError::CanaryFailed(e.to_string()))
        }
    }
}

/// Maps a top-level executor error to a process exit code and logs it the
/// way the binary's `main` should before exiting.
pub fn handle_fatal(err: &ExecutorError) -> ExitCode {
    error!(error = %err, exit_code = ?err.exit_code(), "fatal startup error");
    err.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionEngine, ComparisonReport};
    use crate::shadow_recorder::SignalRecord;
    use chrono::Utc;

    fn sample_decision() -> AdmissionDecision {
        let records: Vec<SignalRecord> = (0..10)
            .map(|i| SignalRecord {
                id: i,
                timestamp_signal: Utc::now(),
                timestamp_log: Utc::now(),
                symbol: "EURUSD.s".into(),
                signal: 0,
                price: 1.08,
                confidence: 0.9,
                tick_ref: None,
            })
            .collect();
        let report = ComparisonReport {
            baseline_f1: 0.5,
            challenger_f1: 0.5985,
            diversity_index: 0.593,
            consistency_rate: 0.9,
        };
        AdmissionEngine::default().evaluate(&records, &report).build()
    }

    #[test]
    fn reads_and_trusts_a_freshly_written_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decision.json");
        let decision = sample_decision();
        std::fs::write(&path, serde_json::to_vec(&decision).unwrap()).unwrap();

        let loaded = read_admission_artifact(&path).unwrap();
        assert!(recompute_and_verify(&loaded, 0.5985));
    }

    #[test]
    fn tampered_artifact_fails_hash_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decision.json");
        let mut decision = sample_decision();
        std::fs::write(&path, serde_json::to_vec(&decision).unwrap()).unwrap();
        decision.p99_latency_ms = 999.0;
        std::fs::write(&path, serde_json::to_vec(&decision).unwrap()).unwrap();

        let loaded = read_admission_artifact(&path).unwrap();
        assert!(!recompute_and_verify(&loaded, 0.5985));
    }

    #[test]
    fn exit_code_mapping_matches_table() {
        assert_eq!(
            handle_fatal(&ExecutorError::DecisionHashMismatch),
            ExitCode::ConfigError
        );
        assert_eq!(
            handle_fatal(&ExecutorError::AdmissionRejected(vec![])),
            ExitCode::AdmissionRejected
        );
        assert_eq!(
            handle_fatal(&ExecutorError::GatewayBlocked { reason: "x".into() }),
            ExitCode::Blocked
        );
        assert_eq!(
            handle_fatal(&ExecutorError::CanaryFailed("x".into())),
            ExitCode::CanaryFailed
        );
    }
}
