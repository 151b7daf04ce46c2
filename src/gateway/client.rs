//! The only path from the core to the broker (C2): a request/reply
//! transport to a single endpoint, serialized by a process-wide lock, with
//! timeouts, bounded retries for idempotent actions, and req_id correlation.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::wire::{read_frame, write_frame, Action, Reply, Request, Status};
use crate::error::ExecutorError;

const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

struct Connection {
    stream: TcpStream,
}

/// Exclusive-use gateway socket. Callers acquire the inner lock only for the
/// span of a single send-receive pair; no task may hold it across an await
/// that isn't part of that exchange.
pub struct GatewayClient {
    endpoint: String,
    default_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl GatewayClient {
    pub fn new(endpoint: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            default_timeout,
            conn: Mutex::new(None),
        }
    }

    /// Issues one request and awaits its correlated reply. Idempotent
    /// actions retry up to three times with exponential backoff; `OPEN_ORDER`
    /// and `CLOSE_ORDER` never retry automatically.
    pub async fn call(&self, action: Action, payload: Value) -> Result<Reply, ExecutorError> {
        if !action.is_idempotent() {
            return self.call_once(action, payload, self.default_timeout).await;
        }
        let mut last_err = None;
        for attempt in 0..=BACKOFF_SCHEDULE.len() {
            match self
                .call_once(action, payload.clone(), self.default_timeout)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(ExecutorError::GatewayBlocked { reason }) => {
                    return Err(ExecutorError::GatewayBlocked { reason })
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < BACKOFF_SCHEDULE.len() {
                        warn!(?action, attempt, "gateway call failed, retrying");
                        tokio::time::sleep(BACKOFF_SCHEDULE[attempt]).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop always runs at least one attempt"))
    }

    /// Performs the trade-mode guard (spec.md section 4.2) before any order
    /// action: `GET_ACCOUNT.trade_mode` must be `REAL`. Any other value
    /// fails the call with `GatewayBlocked` without contacting the broker
    /// again for the order itself.
    pub async fn verify_real_trade_mode(&self) -> Result<(), ExecutorError> {
        let reply = self.call(Action::GetAccount, serde_json::json!({})).await?;
        let data = reply
            .data
            .ok_or_else(|| ExecutorError::GatewayRejected("GET_ACCOUNT returned no data".into()))?;
        let trade_mode = data
            .get("trade_mode")
            .and_then(Value::as_str)
            .unwrap_or("");
        if trade_mode != "REAL" {
            return Err(ExecutorError::GatewayBlocked {
                reason: format!("trade_mode is {trade_mode:?}, expected REAL"),
            });
        }
        let server_name = data.get("server_name").and_then(Value::as_str).unwrap_or("");
        if server_name.contains("Demo") || server_name.contains("Beta") {
            return Err(ExecutorError::GatewayBlocked {
                reason: format!("server name {server_name:?} looks like a non-live environment"),
            });
        }
        Ok(())
    }

    async fn call_once(
        &self,
        action: Action,
        payload: Value,
        timeout: Duration,
    ) -> Result<Reply, ExecutorError> {
        let req_id = Uuid::new_v4().to_string();
        let request = Request {
            action,
            req_id: req_id.clone(),
            timestamp: now_secs(),
            payload,
        };

        let mut guard = self.conn.lock().await;
        let result = tokio::time::timeout(timeout, self.exchange(&mut guard, &request)).await;

        match result {
            Ok(Ok(reply)) => {
                if reply.req_id != req_id {
                    // Mismatched reply: discard and treat as a transport
                    // failure so the caller's retry loop re-sends.
                    *guard = None;
                    return Err(ExecutorError::CorrelationMismatch {
                        expected: req_id,
                        got: reply.req_id,
                    });
                }
                match reply.status {
                    Status::Success | Status::Pending => Ok(reply),
                    Status::Error => Err(ExecutorError::GatewayRejected(
                        reply.error.unwrap_or_else(|| "unspecified error".into()),
                    )),
                }
            }
            Ok(Err(e)) => {
                *guard = None;
                Err(ExecutorError::GatewayTransport(e.to_string()))
            }
            Err(_elapsed) => {
                // Timeout: the socket is closed and recreated so that any
                // half-written protocol state does not leak into the next
                // exchange.
                *guard = None;
                Err(ExecutorError::GatewayTimeout {
                    action: format!("{action:?}"),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn exchange(
        &self,
        guard: &mut Option<Connection>,
        request: &Request,
    ) -> std::io::Result<Reply> {
        if guard.is_none() {
            info!(endpoint = %self.endpoint, "opening gateway connection");
            let stream = TcpStream::connect(&self.endpoint).await?;
            *guard = Some(Connection { stream });
        }
        let conn = guard.as_mut().expect("just populated");
        write_frame(&mut conn.stream, request)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        read_frame(&mut conn.stream)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
