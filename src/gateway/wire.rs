//! Gateway wire protocol (protocol v1): length-prefixed UTF-8 JSON frames
//! over TCP, request/reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Actions the core must be able to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Heartbeat,
    OpenOrder,
    CloseOrder,
    GetAccount,
    GetPositions,
    GetHistory,
}

impl Action {
    /// Non-idempotent actions must not be retried automatically by the
    /// client; the caller decides whether to resubmit.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Action::OpenOrder | Action::CloseOrder)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    pub req_id: String,
    pub timestamp: f64,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Error,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub req_id: String,
    pub status: Status,
    pub timestamp: f64,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame exceeds maximum size: {0} bytes")]
    FrameTooLarge(usize),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Writes a 4-byte big-endian length prefix followed by the JSON body.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    value: &impl Serialize,
) -> Result<(), WireError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
pub async fn read_frame<R: AsyncReadExt + Unpin, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> Result<T, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_reply_round_trips_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let req = Request {
            action: Action::Heartbeat,
            req_id: "abc-123".into(),
            timestamp: 1_700_000_000.0,
            payload: serde_json::json!({}),
        };
        write_frame(&mut client, &req).await.unwrap();
        let received: Request = read_frame(&mut server).await.unwrap();
        assert_eq!(received.req_id, "abc-123");
        assert_eq!(received.action, Action::Heartbeat);

        let reply = Reply {
            req_id: received.req_id,
            status: Status::Success,
            timestamp: 1_700_000_000.1,
            data: Some(serde_json::json!({"status": "alive"})),
            error: None,
        };
        write_frame(&mut server, &reply).await.unwrap();
        let echoed: Reply = read_frame(&mut client).await.unwrap();
        assert_eq!(echoed.req_id, "abc-123");
        assert_eq!(echoed.status, Status::Success);
    }

    #[test]
    fn open_close_order_are_not_idempotent() {
        assert!(!Action::OpenOrder.is_idempotent());
        assert!(!Action::CloseOrder.is_idempotent());
        assert!(Action::Heartbeat.is_idempotent());
        assert!(Action::GetAccount.is_idempotent());
    }
}
