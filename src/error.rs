//! Error taxonomy shared across the channel, runner and registry.

use std::time::Duration;

use thiserror::Error;

/// Failure reading or writing one length-prefixed frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message exceeds max size: {size} > {max}")]
    TooLarge { size: u64, max: u32 },

    #[error("invalid frame encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl FrameError {
    /// True when the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Reason a [`Channel`](crate::channel::Channel) was closed.
///
/// Recorded exactly once; every `wait()` caller observes the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("peer disconnected")]
    Disconnected,

    #[error("failed to receive message: {0}")]
    Receive(String),

    #[error("failed to send message: {0}")]
    Send(String),

    #[error("no subscriber for ID {0}")]
    NoSubscriber(u32),

    #[error("unhandled payload kind {0:?}")]
    UnhandledPayload(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    #[error("closed: {0}")]
    Shutdown(String),
}

impl ChannelError {
    /// Protocol violations are the peer's fault, as opposed to transport loss
    /// or a local shutdown.
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::NoSubscriber(_)
                | Self::UnhandledPayload(_)
                | Self::Malformed(_)
                | Self::FrameTooLarge(_)
        )
    }
}

/// Failure of a single `send_and_wait` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("channel closed before a response arrived")]
    Closed,

    #[error("peer returned an error: {0}")]
    Remote(String),

    #[error("unexpected response kind {0:?}")]
    UnexpectedResponse(&'static str),

    #[error("request ID {0} is still awaiting a response")]
    IdInUse(u32),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("peer {0:?} is not connected")]
    NotConnected(String),
}

/// Why a runner refused to start a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner is shutting down")]
    ShuttingDown,

    #[error("task {0:?} is already running")]
    AlreadyRunning(String),

    #[error("no task builder for kind {0:?}")]
    UnknownKind(String),

    #[error("invalid task parameters: {0}")]
    InvalidTask(String),
}

/// Classified failure of one task, delivered inside its result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("canceled")]
    Canceled,

    #[error("killed after timeout of {0:?}")]
    TimedOut(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Rejection of a connecting agent before any session exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("empty agent ID")]
    EmptyId,

    #[error("no agent with ID {0:?}")]
    Unknown(String),

    #[error("{id:?} is not an agent principal (found {found})")]
    WrongType { id: String, found: String },

    #[error("missing version for agent {0:?}")]
    MissingVersion(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Failure to establish a session from the agent side.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to dial: {0}")]
    Dial(#[source] std::io::Error),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[from] FrameError),

    #[error("controller rejected connection: {0}")]
    Rejected(String),

    #[error("empty server version in metadata")]
    MissingServerVersion,

    #[error("initial ping failed: {0}")]
    Ping(#[from] RequestError),
}
