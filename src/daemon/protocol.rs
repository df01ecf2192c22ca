//! IPC wire format.
//!
//! Every message is a JSON envelope behind a length prefix:
//!
//! ```text
//! [4-byte length (big-endian)][UTF-8 JSON envelope]
//! ```
//!
//! A connection carries any number of request/response pairs; after
//! `subscribeEvents` the daemon also pushes `event` envelopes on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PandemicError;
use crate::events::Event;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Incoming request. Everything but `id` is optional at this level so a
/// malformed request still gets a correlated error.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "type", default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn success(id: impl Into<String>, command: Option<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            command,
            status: Status::Success,
            payload: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        id: impl Into<String>,
        command: Option<String>,
        kind: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            command,
            status: Status::Error,
            payload: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(id: impl Into<String>, command: Option<String>, err: &PandemicError) -> Self {
        Self::failure(id, command, err.kind(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Pushed to subscribers; `id` is the event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub command: String,
    pub payload: Event,
    pub timestamp: DateTime<Utc>,
}

impl From<Event> for EventMessage {
    fn from(event: Event) -> Self {
        Self {
            id: event.event_id.clone(),
            message_type: MessageType::Event,
            command: event.event_type.clone(),
            timestamp: event.timestamp,
            payload: event,
        }
    }
}

/// Message frame for the wire protocol.
pub struct MessageFrame;

impl MessageFrame {
    /// Serialize `message` and prepend its length.
    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
        let body = serde_json::to_vec(message)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(body.len()));
        }
        let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge(body.len()))?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_be_bytes(*buf) as usize
    }
}

/// Read one frame body. `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = MessageFrame::read_length(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = MessageFrame::encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
