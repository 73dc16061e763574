//! Transport layer for agent ↔ controller communication.
//!
//! Provides the `Connector` trait, the wire `Frame`, and length-prefixed
//! JSON framing functions. Any ordered, reliable byte stream works: TCP in
//! production, `tokio::io::duplex` in tests.

pub mod protocol;

pub use protocol::{
    AgentConnectMetadata, AgentRequest, AgentResponse, AgentSide, ControllerSide, Payload,
    ServerConnectMetadata, ServerRequest, ServerResponse, Side,
};

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::FrameError;

/// Maximum message size (64 MB). Safety valve against malformed messages.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Frame kind carried by error responses that have no payload.
pub const ERROR_KIND: &str = "error";

/// Correlation ID reserved for fire-and-forget notifications.
pub const NOTIFICATION_ID: u32 = 0;

/// One message on the wire.
///
/// `kind` names the payload variant and `body` carries its fields. A response
/// frame may instead carry `error` with kind [`ERROR_KIND`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u32,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    /// Wrap a payload with the given correlation ID.
    pub fn new<P: Payload>(id: u32, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id,
            kind: payload.kind().to_string(),
            body: payload.to_body()?,
            error: None,
        })
    }

    /// Error response for request `id`.
    pub fn error(id: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: ERROR_KIND.to_string(),
            body: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A full-duplex byte stream the channel can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

/// Boxed stream handed out by a [`Connector`].
pub type BoxStream = Box<dyn Stream>;

/// Abstraction over how the agent reaches the controller.
///
/// Implementations handle connection-specific details (TCP, TLS, in-memory
/// pipes) while the client works with this uniform interface.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh stream to the controller.
    async fn connect(&self) -> std::io::Result<BoxStream>;

    /// Human-readable target, for logs.
    fn target(&self) -> String;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<BoxStream> {
        debug!(address = %self.address, "Dialing controller");
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        self.address.clone()
    }
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(FrameError::TooLarge {
            size: payload.len() as u64,
            max: MAX_MESSAGE_SIZE,
        })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: u64::from(len),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize `value` as JSON and write it as one frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    send_message(writer, &bytes).await
}

/// Read one frame and decode it as JSON, giving up after `timeout`.
pub async fn read_json<R, T>(reader: &mut R, timeout: Duration) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let bytes = tokio::time::timeout(timeout, recv_message(reader))
        .await
        .map_err(|_| {
            FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no frame within {timeout:?}"),
            ))
        })??;
    Ok(serde_json::from_slice(&bytes)?)
}
