//! Connection capability shared between sessions and the hub.
//!
//! The hub only ever sees a [`Connection`]: something it can hand bytes to
//! and close. [`QueuedConnection`] is the standard implementation, backed by
//! a bounded outbound queue that a transport writer drains, so a publish
//! never waits on a slow socket.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{counter:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// Outbound queue is full and the frame was dropped.
    #[error("Outbound queue full")]
    Backpressure,

    /// Outbound queue overflowed and the connection was closed.
    #[error("Outbound queue overflow, connection closed")]
    Overflow,

    /// Failed to write to the transport.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to read from the transport.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The send/close capability the hub fans out to.
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Enqueue one serialized frame for delivery.
    ///
    /// Must not block.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be queued.
    fn send(&self, frame: Bytes) -> Result<(), ConnectionError>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// What to do when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the frame that did not fit and keep the connection.
    #[default]
    DropNewest,
    /// Close the connection; its session cleans up.
    Disconnect,
}

/// A frame waiting to be written by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized message.
    Frame(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Reply to a client probe.
    Pong(Bytes),
}

/// A [`Connection`] backed by a bounded queue.
pub struct QueuedConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    policy: OverflowPolicy,
    closed: CancellationToken,
}

impl QueuedConnection {
    /// Create a connection and the receiving end its writer drains.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        Self::with_id(ConnectionId::generate(), capacity, policy)
    }

    /// Create a connection with a caller-chosen ID.
    #[must_use]
    pub fn with_id(
        id: ConnectionId,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id,
            tx,
            policy,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// Queue a liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe could not be queued.
    pub fn ping(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.enqueue(Outbound::Ping(data))
    }

    /// Queue a reply to a client probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply could not be queued.
    pub fn pong(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.enqueue(Outbound::Pong(data))
    }

    /// Whether [`Connection::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Token cancelled on close, for writer tasks.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(ConnectionError::Closed)
            }
            Err(TrySendError::Full(_)) => match self.policy {
                OverflowPolicy::DropNewest => Err(ConnectionError::Backpressure),
                OverflowPolicy::Disconnect => {
                    warn!(connection = %self.id, "Outbound queue overflow, disconnecting");
                    self.close();
                    Err(ConnectionError::Overflow)
                }
            },
        }
    }
}

impl Connection for QueuedConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        self.enqueue(Outbound::Frame(frame))
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(connection = %self.id, "Closing connection");
            self.closed.cancel();
        }
    }
}

impl fmt::Debug for QueuedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedConnection")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Application text frame.
    Text(String),
    /// Application binary frame.
    Binary(Bytes),
    /// Client liveness probe.
    Ping(Bytes),
    /// Reply to our liveness probe.
    Pong(Bytes),
}

/// The read half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the client closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<InboundFrame>, ConnectionError>;
}

/// Sender half feeding a [`ChannelReader`].
pub type FrameSender = mpsc::UnboundedSender<Result<InboundFrame, ConnectionError>>;

/// An in-process [`FrameReader`] fed through a channel.
///
/// Dropping every [`FrameSender`] reads as a clean close.
#[derive(Debug)]
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Result<InboundFrame, ConnectionError>>,
}

impl ChannelReader {
    /// Create a reader and the sender that feeds it.
    #[must_use]
    pub fn pair() -> (FrameSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, ConnectionError> {
        self.rx.recv().await.transpose()
    }
}
